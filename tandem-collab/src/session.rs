//! Per-connection session state.
//!
//! ```text
//! Connected ──join──► Joining ──ok──► Active ──close──► Disconnected
//!     ▲                  │                │
//!     └──── rejected ────┘                └── join elsewhere: leave, then Joining
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use uuid::Uuid;

use tandem_core::{SessionId, WorkspaceId};

/// Transport-level handle of one websocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Connected,
    Joining,
    Active,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: SessionId,
    pub connection: ConnectionId,
    pub state: SessionState,
    /// Set exactly when the state is `Active`.
    pub workspace: Option<WorkspaceId>,
    /// File this session has open (tree mode).
    pub open_file: Option<String>,
    pub can_write: bool,
}

impl Session {
    pub fn new(id: SessionId, connection: ConnectionId) -> Self {
        Self {
            id,
            connection,
            state: SessionState::Connected,
            workspace: None,
            open_file: None,
            can_write: false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }

    /// The joined workspace, if the session is active.
    pub fn active_workspace(&self) -> Option<&WorkspaceId> {
        if self.is_active() {
            self.workspace.as_ref()
        } else {
            None
        }
    }

    pub fn enter(&mut self, workspace: WorkspaceId, can_write: bool) {
        self.state = SessionState::Active;
        self.workspace = Some(workspace);
        self.open_file = None;
        self.can_write = can_write;
    }

    /// Back to `Connected`; returns the workspace that was left.
    pub fn leave(&mut self) -> Option<WorkspaceId> {
        self.state = SessionState::Connected;
        self.open_file = None;
        self.can_write = false;
        self.workspace.take()
    }
}

/// All sessions of the process, keyed by connection.
///
/// The map lock is held only for lookups and updates, never across a
/// workspace operation.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ConnectionId, Session>>,
    next_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for a new connection with the next id.
    pub async fn register(&self, connection: ConnectionId) -> Session {
        let id = SessionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let session = Session::new(id, connection);
        self.sessions.write().await.insert(connection, session.clone());
        session
    }

    pub async fn get(&self, connection: ConnectionId) -> Option<Session> {
        self.sessions.read().await.get(&connection).cloned()
    }

    /// Mutate a session in place; `None` if it is gone.
    pub async fn update<R>(&self, connection: ConnectionId, f: impl FnOnce(&mut Session) -> R) -> Option<R> {
        let mut sessions = self.sessions.write().await;
        sessions.get_mut(&connection).map(f)
    }

    pub async fn remove(&self, connection: ConnectionId) -> Option<Session> {
        self.sessions.write().await.remove(&connection)
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
