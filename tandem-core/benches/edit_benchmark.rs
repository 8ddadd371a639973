use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use std::hint::black_box;
use tandem_core::{ChangeRecord, EditOperation, OffsetUnit, TextBuffer};

fn sample_text(lines: usize) -> String {
    (0..lines)
        .map(|i| format!("line {i}: the quick brown fox jumps over the lazy dog\n"))
        .collect()
}

fn bench_keystroke(c: &mut Criterion) {
    let mut group = c.benchmark_group("Edit Operations");
    group.throughput(Throughput::Elements(1));

    for unit in [OffsetUnit::Byte, OffsetUnit::Utf16] {
        group.bench_function(format!("keystroke_mid_10k_lines_{unit:?}"), |b| {
            let text = sample_text(10_000);
            let middle = text.len() / 2;
            b.iter(|| {
                let mut buf = TextBuffer::new(text.clone(), unit);
                let op = EditOperation::new(vec![ChangeRecord::insert(middle, "x")]);
                black_box(buf.apply(black_box(&op)));
            })
        });
    }

    group.finish();
}

fn bench_batched_changes(c: &mut Criterion) {
    let mut group = c.benchmark_group("Edit Operations");
    let changes: Vec<ChangeRecord> = (0..100).map(|i| ChangeRecord::new(i * 50, 4, "edit")).collect();
    let op = EditOperation::new(changes);
    group.throughput(Throughput::Elements(op.changes.len() as u64));

    group.bench_function("multi_cursor_100_changes", |b| {
        let text = sample_text(1_000);
        b.iter(|| {
            let mut buf = TextBuffer::new(text.clone(), OffsetUnit::Utf16);
            black_box(buf.apply(black_box(&op)));
        })
    });

    group.finish();
}

criterion_group!(benches, bench_keystroke, bench_batched_changes);
criterion_main!(benches);
