use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use serde_json::json;
use std::hint::black_box;
use tandem_collab::broadcast::{Audience, BroadcastGroup};
use tandem_collab::presence::{PresenceTracker, Selection};
use tandem_collab::protocol::{ClientMessage, SelectionUpdate, ServerMessage};
use tandem_collab::storage::MemoryStore;
use tandem_collab::sync::TextSyncEngine;
use tandem_collab::workspace::{Document, Workspace};
use tandem_core::{OffsetUnit, SessionId, TextBuffer, WorkspaceId};
use std::sync::Arc;

fn keystroke_frame() -> String {
    json!({
        "event": "text-change",
        "data": {"changes": [{"rangeOffset": 1024, "rangeLength": 0, "text": "x"}], "versionId": 42}
    })
    .to_string()
}

fn bench_frame_decode(c: &mut Criterion) {
    let frame = keystroke_frame();
    c.bench_function("text_change_decode", |b| {
        b.iter(|| black_box(ClientMessage::decode(black_box(&frame)).unwrap()))
    });
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("Broadcast");
    let msg = ServerMessage::TextChange(json!({"changes": [{"rangeOffset": 0, "rangeLength": 0, "text": "x"}]}));

    for peers in [10usize, 100] {
        group.throughput(Throughput::Elements(peers as u64));
        group.bench_function(format!("publish_to_{peers}_peers"), |b| {
            let broadcast = BroadcastGroup::new(1024);
            let mut receivers: Vec<_> = (0..peers).map(|_| broadcast.subscribe()).collect();
            b.iter(|| {
                broadcast.publish(&msg, Audience::AllExcept(SessionId(0))).unwrap();
                for rx in receivers.iter_mut() {
                    black_box(rx.try_recv().ok());
                }
            })
        });
    }

    group.finish();
}

fn bench_apply_and_broadcast(c: &mut Criterion) {
    let engine = TextSyncEngine::new(Arc::new(MemoryStore::new()), None);
    let tracker = PresenceTracker::new();
    let text = "lorem ipsum dolor sit amet\n".repeat(2_000);
    let payload = json!({"changes": [{"rangeOffset": 1024, "rangeLength": 1, "text": "y"}]});

    c.bench_function("apply_and_broadcast_keystroke", |b| {
        let mut ws = Workspace::new(
            WorkspaceId::new("bench.txt"),
            Document::Text(TextBuffer::new(text.clone(), OffsetUnit::Utf16)),
            OffsetUnit::Utf16,
            1024,
        );
        tracker.join(&mut ws, SessionId(1));
        b.iter(|| {
            black_box(
                engine
                    .apply_and_broadcast(&mut ws, SessionId(1), None, payload.clone())
                    .unwrap(),
            );
        })
    });
}

fn bench_selection_update(c: &mut Criterion) {
    let tracker = PresenceTracker::new();
    let mut ws = Workspace::new(
        WorkspaceId::new("bench.txt"),
        Document::Text(TextBuffer::default()),
        OffsetUnit::Utf16,
        1024,
    );
    tracker.join(&mut ws, SessionId(1));

    c.bench_function("selection_update", |b| {
        b.iter(|| {
            let update = SelectionUpdate {
                selection: Some(Selection::new(1, 1, 4, 20)),
                secondary_selections: Some(vec![Selection::caret(9, 3)]),
            };
            black_box(tracker.update_selection(&mut ws, SessionId(1), update));
        })
    });
}

criterion_group!(
    benches,
    bench_frame_decode,
    bench_fan_out,
    bench_apply_and_broadcast,
    bench_selection_update
);
criterion_main!(benches);
