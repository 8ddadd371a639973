//! Persistence behaviour: scaffolding, save on last leave, idle autosave and
//! explicit saves, against both the directory store and the recording
//! in-memory store.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use tandem_collab::client::{ClientEvent, EditorClient};
use tandem_collab::gateway::SessionGateway;
use tandem_collab::protocol::{ClientMessage, JoinRequest, ServerMessage};
use tandem_collab::server::{ServerConfig, SyncServer};
use tandem_collab::session::ConnectionId;
use tandem_collab::storage::{MemoryStore, PersistenceBridge, Stored, DEFAULT_README};
use tandem_collab::workspace::{WorkspaceMode, WorkspaceStore};
use tandem_core::{ChangeRecord, OffsetUnit, WorkspaceId};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Duration};

async fn start_test_server(server: SyncServer) -> String {
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

async fn join_client(url: &str, workspace: &str) -> (EditorClient, mpsc::Receiver<ClientEvent>) {
    let mut client = EditorClient::new(url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    next_message(&mut events).await; // connected
    client.join(workspace).await.unwrap();
    assert!(matches!(next_message(&mut events).await, ServerMessage::Workspace(_)));
    (client, events)
}

async fn wait_until(mut check: impl FnMut() -> bool) -> bool {
    timeout(Duration::from_secs(2), async {
        while !check() {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

fn read(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok()
}

#[tokio::test]
async fn test_tree_workspace_scaffolded_with_readme() {
    let dir = TempDir::new().unwrap();
    let config = ServerConfig {
        mode: WorkspaceMode::Tree,
        ..ServerConfig::for_testing(dir.path())
    };
    let url = start_test_server(SyncServer::new(config)).await;

    let mut client = EditorClient::new(&url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    next_message(&mut events).await;
    client.join("fresh").await.unwrap();

    match next_message(&mut events).await {
        ServerMessage::Workspace(snapshot) => {
            let tree = snapshot.filesystem.unwrap();
            assert_eq!(tree.file_count(), 1);
            assert_eq!(tree.find("README.md").unwrap().content.as_deref(), Some(DEFAULT_README));
        }
        other => panic!("expected snapshot, got {other:?}"),
    }
    assert_eq!(read(&dir.path().join("fresh/README.md")).as_deref(), Some(DEFAULT_README));
}

#[tokio::test]
async fn test_last_leave_persists_exactly_once() {
    let backend = Arc::new(MemoryStore::new().with_text("doc.txt", "abc"));
    let server = SyncServer::with_bridge(ServerConfig::for_testing("/srv/tandem"), backend.clone());
    let url = start_test_server(server).await;

    let (alice, _alice_events) = join_client(&url, "doc.txt").await;
    let (bob, _bob_events) = join_client(&url, "doc.txt").await;
    alice.send_edit(vec![ChangeRecord::insert(3, "d")]).await.unwrap();

    drop(alice);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.save_count("doc.txt"), 0, "saved while a member remained");

    drop(bob);
    assert!(wait_until(|| backend.save_count("doc.txt") == 1).await);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(backend.save_count("doc.txt"), 1);
    assert_eq!(backend.stored("doc.txt"), Some(Stored::Text("abcd".into())));
}

#[tokio::test]
async fn test_failed_save_does_not_block_teardown() {
    let backend = Arc::new(MemoryStore::new().with_text("doc.txt", "abc"));
    backend.set_fail_saves(true);
    let server = SyncServer::with_bridge(ServerConfig::for_testing("/srv/tandem"), backend.clone());
    let url = start_test_server(server).await;

    let (alice, _events) = join_client(&url, "doc.txt").await;
    alice.send_edit(vec![ChangeRecord::insert(0, "x")]).await.unwrap();
    drop(alice);
    assert!(wait_until(|| backend.save_count("doc.txt") == 1).await);

    // The workspace was torn down; a new join reloads the last stored text.
    backend.set_fail_saves(false);
    let mut client = EditorClient::new(&url);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    next_message(&mut events).await;
    client.join("doc.txt").await.unwrap();
    match next_message(&mut events).await {
        ServerMessage::Workspace(snapshot) => assert_eq!(snapshot.text.as_deref(), Some("abc")),
        other => panic!("expected snapshot, got {other:?}"),
    }
}

#[tokio::test]
async fn test_idle_autosave_while_connected() {
    let dir = TempDir::new().unwrap();
    let project = dir.path().join("proj");
    fs::create_dir_all(&project).unwrap();
    fs::write(project.join("a.txt"), "a").unwrap();

    let config = ServerConfig {
        mode: WorkspaceMode::Tree,
        save_interval: Duration::ZERO,
        ..ServerConfig::for_testing(dir.path())
    };
    let url = start_test_server(SyncServer::new(config)).await;

    let (client, mut events) = join_client(&url, "proj").await;
    client.open_file("a.txt").await.unwrap();
    assert!(matches!(next_message(&mut events).await, ServerMessage::FileOpened(_)));
    client.send_edit(vec![ChangeRecord::insert(1, "bc")]).await.unwrap();

    let path = project.join("a.txt");
    assert!(wait_until(|| read(&path).as_deref() == Some("abc")).await);
}

#[tokio::test]
async fn test_single_mode_interval_flush_on_edit() {
    let backend = Arc::new(MemoryStore::new());
    let config = ServerConfig {
        save_interval: Duration::ZERO,
        autosave_tick: Duration::from_secs(3600),
        ..ServerConfig::for_testing("/srv/tandem")
    };
    let url = start_test_server(SyncServer::with_bridge(config, backend.clone())).await;

    let (client, _events) = join_client(&url, "draft.txt").await;
    client.send_edit(vec![ChangeRecord::insert(0, "first")]).await.unwrap();
    assert!(wait_until(|| backend.stored("draft.txt") == Some(Stored::Text("first".into()))).await);
}

#[tokio::test]
async fn test_concurrent_first_joins_share_one_load() {
    let backend = Arc::new(MemoryStore::new().with_text("doc.txt", "seed"));
    let store = Arc::new(WorkspaceStore::new(
        backend.clone() as Arc<dyn PersistenceBridge>,
        WorkspaceMode::Single,
        OffsetUnit::Utf16,
        64,
    ));
    let gateway = Arc::new(SessionGateway::new("/srv/tandem", store.clone(), Duration::from_secs(60)));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let gateway = gateway.clone();
        tasks.push(tokio::spawn(async move {
            let conn = ConnectionId::new();
            gateway.connect(conn).await;
            let outcome = gateway
                .handle(conn, ClientMessage::Join(JoinRequest::Workspace("doc.txt".into())))
                .await;
            (conn, outcome)
        }));
    }

    let mut connections = Vec::new();
    for task in tasks {
        let (conn, outcome) = task.await.unwrap();
        assert!(matches!(outcome.replies[0], ServerMessage::Workspace(_)));
        connections.push(conn);
    }
    assert_eq!(store.len().await, 1);
    let handle = store.get(&WorkspaceId::new("doc.txt")).await.unwrap();
    assert_eq!(handle.lock().await.users().len(), 8);

    // Edits from everyone land in one total order.
    for (i, conn) in connections.iter().enumerate() {
        let payload = json!({"changes": [{"rangeOffset": 0, "rangeLength": 0, "text": i.to_string()}]});
        gateway.handle(*conn, ClientMessage::TextChange(payload)).await;
    }
    assert_eq!(handle.lock().await.text(), Some("76543210seed"));

    for conn in connections {
        gateway.disconnect(conn).await;
    }
    assert_eq!(backend.save_count("doc.txt"), 1);
    assert!(store.is_empty().await);
}
