//! Presence over real connections: join/leave announcements, colors and
//! selection relay.

use serde_json::json;
use tandem_collab::client::{ClientEvent, EditorClient};
use tandem_collab::presence::{Selection, PALETTE};
use tandem_collab::protocol::ServerMessage;
use tandem_collab::server::{ServerConfig, SyncServer};
use tandem_collab::storage::MemoryStore;
use tandem_core::SessionId;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

async fn start_test_server() -> String {
    let server = SyncServer::with_bridge(ServerConfig::for_testing("/srv/tandem"), Arc::new(MemoryStore::new()));
    let listener = server.bind().await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let _ = server.serve(listener).await;
    });
    format!("ws://127.0.0.1:{port}")
}

async fn next_message(events: &mut mpsc::Receiver<ClientEvent>) -> ServerMessage {
    match timeout(Duration::from_secs(2), events.recv()).await {
        Ok(Some(ClientEvent::Message(msg))) => msg,
        other => panic!("expected a server message, got {other:?}"),
    }
}

/// Connect and join `workspace`; returns the client, its events and its id.
async fn join_client(url: &str, workspace: &str) -> (EditorClient, mpsc::Receiver<ClientEvent>, SessionId) {
    let mut client = EditorClient::new(url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    assert_eq!(next_message(&mut events).await, ServerMessage::Connected);

    client.join(workspace).await.unwrap();
    let id = match next_message(&mut events).await {
        ServerMessage::Workspace(snapshot) => snapshot.presence.id,
        other => panic!("expected snapshot, got {other:?}"),
    };
    (client, events, id)
}

#[tokio::test]
async fn test_presence_join_broadcast() {
    let url = start_test_server().await;
    let (_alice, mut alice_events, alice_id) = join_client(&url, "doc.txt").await;

    let mut bob = EditorClient::new(&url);
    let mut bob_events = bob.take_event_rx().unwrap();
    bob.connect().await.unwrap();
    next_message(&mut bob_events).await;
    bob.join("doc.txt").await.unwrap();

    let ServerMessage::Workspace(snapshot) = next_message(&mut bob_events).await else {
        panic!("expected snapshot");
    };
    assert_eq!(snapshot.users.len(), 1);
    let alice = &snapshot.users[&alice_id];
    assert!(PALETTE.contains(&alice.color));
    assert!(PALETTE.contains(&snapshot.presence.color));
    assert!(!snapshot.users.contains_key(&snapshot.presence.id));

    match next_message(&mut alice_events).await {
        ServerMessage::UserJoined(presence) => {
            assert_eq!(presence, snapshot.presence);
            assert!(presence.selection.is_none());
        }
        other => panic!("expected user-joined, got {other:?}"),
    }
}

#[tokio::test]
async fn test_selection_sync() {
    let url = start_test_server().await;
    let (alice, _alice_events, alice_id) = join_client(&url, "doc.txt").await;
    let (_bob, mut bob_events, _) = join_client(&url, "doc.txt").await;

    let primary = Selection::new(1, 1, 1, 6);
    let secondary = vec![Selection::caret(3, 2)];
    alice.send_selection(primary.clone(), secondary.clone()).await.unwrap();

    match next_message(&mut bob_events).await {
        ServerMessage::Selection(changed) => {
            assert_eq!(changed.user_id, alice_id);
            assert_eq!(changed.selection, primary);
            assert_eq!(changed.secondary_selections, secondary);
        }
        other => panic!("expected selection, got {other:?}"),
    }

    // A primary caret is relayed as-is, start and end on the same column.
    let caret = Selection::caret(2, 4);
    alice.send_selection(caret.clone(), Vec::new()).await.unwrap();
    match next_message(&mut bob_events).await {
        ServerMessage::Selection(changed) => {
            assert!(changed.selection.is_caret());
            assert_eq!(changed.selection, caret);
            assert_eq!(changed.selection.end_column, 4);
        }
        other => panic!("expected selection, got {other:?}"),
    }
    alice.send_selection(primary.clone(), secondary.clone()).await.unwrap();
    next_message(&mut bob_events).await;

    // A late joiner sees the stored selection in its snapshot.
    let mut carol = EditorClient::new(&url);
    let mut carol_events = carol.take_event_rx().unwrap();
    carol.connect().await.unwrap();
    next_message(&mut carol_events).await;
    carol.join("doc.txt").await.unwrap();
    let ServerMessage::Workspace(snapshot) = next_message(&mut carol_events).await else {
        panic!("expected snapshot");
    };
    assert_eq!(snapshot.users[&alice_id].selection.as_ref(), Some(&primary));
}

#[tokio::test]
async fn test_incomplete_selection_dropped() {
    let url = start_test_server().await;
    let (alice, _alice_events, _) = join_client(&url, "doc.txt").await;
    let (_bob, mut bob_events, _) = join_client(&url, "doc.txt").await;

    let frame = json!({
        "event": "selection",
        "data": {"selection": {"startLineNumber": 1, "startColumn": 1, "endLineNumber": 1, "endColumn": 1}}
    });
    alice.send_raw(frame.to_string()).await.unwrap();

    let quiet = timeout(Duration::from_millis(200), bob_events.recv()).await;
    assert!(quiet.is_err(), "incomplete selection must not be relayed: {quiet:?}");
}

#[tokio::test]
async fn test_presence_isolated_between_workspaces() {
    let url = start_test_server().await;
    let (alice, _alice_events, _) = join_client(&url, "a.txt").await;
    let (_bob, mut bob_events, _) = join_client(&url, "b.txt").await;

    alice.send_selection(Selection::caret(1, 1), Vec::new()).await.unwrap();
    alice.send_edit(vec![tandem_core::ChangeRecord::insert(0, "x")]).await.unwrap();

    let quiet = timeout(Duration::from_millis(200), bob_events.recv()).await;
    assert!(quiet.is_err(), "events leaked across workspaces: {quiet:?}");
}
