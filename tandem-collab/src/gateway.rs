//! Session gateway: the single entry point for every inbound message.
//!
//! The gateway owns the session registry. Each call looks the session up by
//! its connection, checks what the message is allowed to do, and dispatches
//! to the workspace store, the presence tracker or the sync engine with the
//! target workspace locked.
//!
//! Validation and authorization failures come back as an `error` reply to the
//! requester. Malformed payloads are dropped without a reply.

use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use tandem_core::path::{self, IdentifierKind};
use tandem_core::{SessionId, WorkspaceId};

use crate::broadcast::{Audience, Envelope};
use crate::hooks::{AccessCheck, AccessDecision, EventContext, EventHandler, IgnoreEvents, JoinContext, OpenAccess};
use crate::presence::PresenceTracker;
use crate::protocol::{ClientMessage, CustomEvent, FileFocus, JoinRequest, SelectionUpdate, ServerMessage};
use crate::session::{ConnectionId, Session, SessionRegistry, SessionState};
use crate::sync::TextSyncEngine;
use crate::workspace::{WorkspaceMode, WorkspaceStore};

pub const ERR_INVALID_WORKSPACE: &str = "Invalid workspace name";
pub const ERR_INVALID_FILE: &str = "Invalid file name";
pub const ERR_WRITE_REQUIRED: &str = "Permission denied: write access required";
pub const ERR_NOT_JOINED: &str = "Join a workspace first";
pub const ERR_NO_TREE: &str = "Workspace has no file tree";
pub const ERR_LOAD_FAILED: &str = "Could not load workspace";

/// What to do with the broadcast subscription of a connection.
#[derive(Debug, Default)]
pub enum Subscription {
    #[default]
    Keep,
    /// Switch to a new workspace's channel.
    Replace(broadcast::Receiver<Arc<Envelope>>),
    /// Stop listening; the session left its workspace.
    Drop,
}

/// Result of handling one inbound message.
#[derive(Debug, Default)]
pub struct Outcome {
    /// Frames for the sender only.
    pub replies: Vec<ServerMessage>,
    pub subscription: Subscription,
}

impl Outcome {
    fn reply(msg: ServerMessage) -> Self {
        Self {
            replies: vec![msg],
            subscription: Subscription::Keep,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self::reply(ServerMessage::error(message))
    }
}

pub struct SessionGateway {
    root: PathBuf,
    mode: WorkspaceMode,
    store: Arc<WorkspaceStore>,
    sync: TextSyncEngine,
    presence: PresenceTracker,
    access: Arc<dyn AccessCheck>,
    events: Arc<dyn EventHandler>,
    sessions: SessionRegistry,
}

impl SessionGateway {
    /// `root` is the directory workspace identifiers are validated against.
    /// In single-buffer mode edits flush once `save_interval` has passed
    /// since the last persist.
    pub fn new(root: impl Into<PathBuf>, store: Arc<WorkspaceStore>, save_interval: Duration) -> Self {
        let mode = store.mode();
        let interval = match mode {
            WorkspaceMode::Single => Some(save_interval),
            WorkspaceMode::Tree => None,
        };
        Self {
            root: root.into(),
            mode,
            sync: TextSyncEngine::new(store.bridge().clone(), interval),
            store,
            presence: PresenceTracker::new(),
            access: Arc::new(OpenAccess::default()),
            events: Arc::new(IgnoreEvents),
            sessions: SessionRegistry::new(),
        }
    }

    pub fn with_access(mut self, access: Arc<dyn AccessCheck>) -> Self {
        self.access = access;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    pub fn with_presence(mut self, presence: PresenceTracker) -> Self {
        self.presence = presence;
        self
    }

    pub fn store(&self) -> &Arc<WorkspaceStore> {
        &self.store
    }

    pub fn mode(&self) -> WorkspaceMode {
        self.mode
    }

    pub async fn session(&self, connection: ConnectionId) -> Option<Session> {
        self.sessions.get(connection).await
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.len().await
    }

    /// Register a new connection. The caller answers with `connected`.
    pub async fn connect(&self, connection: ConnectionId) -> SessionId {
        let session = self.sessions.register(connection).await;
        log::info!("Session {} connected ({connection})", session.id);
        session.id
    }

    /// Tear a connection down: leave its workspace and forget the session.
    /// Safe to call more than once.
    pub async fn disconnect(&self, connection: ConnectionId) -> bool {
        let Some(mut session) = self.sessions.remove(connection).await else {
            return false;
        };
        if let Some(id) = session.leave() {
            self.leave_workspace(session.id, &id).await;
        }
        session.state = SessionState::Disconnected;
        log::info!("Session {} disconnected", session.id);
        true
    }

    /// Count frames a connection's subscription skipped against its workspace.
    pub async fn record_lag(&self, connection: ConnectionId, skipped: u64) {
        let Some(session) = self.sessions.get(connection).await else {
            return;
        };
        let Some(id) = session.active_workspace() else {
            return;
        };
        if let Some(handle) = self.store.get(id).await {
            handle.lock().await.broadcast().record_lag(skipped);
        }
    }

    /// Bring a connection that missed broadcasts back in step: a fresh
    /// snapshot and a new subscription, both taken under the workspace lock so
    /// nothing falls between them. `None` if the session is not in a workspace.
    pub async fn resync(&self, connection: ConnectionId) -> Option<(ServerMessage, broadcast::Receiver<Arc<Envelope>>)> {
        let session = self.sessions.get(connection).await?;
        let id = session.active_workspace()?;
        let handle = self.store.get(id).await?;
        let workspace = handle.lock().await;
        let presence = workspace.users().get(&session.id)?.clone();
        let receiver = workspace.subscribe();
        log::info!("Resyncing session {} on {id}", session.id);
        Some((ServerMessage::Workspace(workspace.snapshot(session.id, presence)), receiver))
    }

    pub async fn handle(&self, connection: ConnectionId, msg: ClientMessage) -> Outcome {
        let Some(session) = self.sessions.get(connection).await else {
            log::debug!("Dropping {} from unknown connection {connection}", msg.event_name());
            return Outcome::default();
        };

        match msg {
            ClientMessage::Join(req) => self.join(connection, session, req).await,
            ClientMessage::Selection(update) => self.selection(&session, update).await,
            ClientMessage::TextChange(payload) => self.text_change(&session, payload).await,
            ClientMessage::OpenFile(path) => self.open_file(connection, &session, path).await,
            ClientMessage::SaveWorkspace => self.save(&session).await,
            ClientMessage::CustomEvent(event) => self.custom_event(connection, &session, event).await,
        }
    }

    async fn join(&self, connection: ConnectionId, session: Session, req: JoinRequest) -> Outcome {
        let kind = match self.mode {
            WorkspaceMode::Single => IdentifierKind::FileName,
            WorkspaceMode::Tree => IdentifierKind::TreePath,
        };
        let candidate = req.workspace();
        let Some(canonical) = path::canonical(&self.root, candidate, kind) else {
            log::warn!("Session {} asked for invalid workspace {candidate:?}", session.id);
            return Outcome::error(ERR_INVALID_WORKSPACE);
        };
        let id = WorkspaceId::new(canonical);

        let previous = session.state;
        self.sessions
            .update(connection, |s| s.state = SessionState::Joining)
            .await;

        let ctx = JoinContext {
            session: session.id,
            workspace: &id,
            params: req.params(),
        };
        let can_write = match self.access.check_join(&ctx) {
            AccessDecision::Allow { can_write } => can_write,
            AccessDecision::Deny(reason) => {
                log::info!("Session {} denied access to {id}: {reason}", session.id);
                self.sessions.update(connection, |s| s.state = previous).await;
                return Outcome::error(format!("Access denied: {reason}"));
            }
        };

        if let Some(old) = session.active_workspace() {
            self.leave_workspace(session.id, old).await;
            self.sessions.update(connection, |s| s.leave()).await;
        }

        let (snapshot, receiver) = loop {
            let handle = match self.store.get_or_create(&id).await {
                Ok(handle) => handle,
                Err(e) => {
                    log::error!("Failed to load workspace {id}: {e}");
                    self.sessions
                        .update(connection, |s| s.state = SessionState::Connected)
                        .await;
                    return Outcome {
                        replies: vec![ServerMessage::error(ERR_LOAD_FAILED)],
                        subscription: Subscription::Drop,
                    };
                }
            };
            let mut workspace = handle.lock().await;
            // Lost a race with the last member leaving; load it again.
            if workspace.is_closed() {
                continue;
            }
            let presence = self.presence.join(&mut workspace, session.id);
            let receiver = workspace.subscribe();
            break (workspace.snapshot(session.id, presence), receiver);
        };

        let entered = self
            .sessions
            .update(connection, |s| s.enter(id.clone(), can_write))
            .await;
        if entered.is_none() {
            self.leave_workspace(session.id, &id).await;
            return Outcome::default();
        }

        log::info!("Session {} joined {id}", session.id);
        Outcome {
            replies: vec![ServerMessage::Workspace(snapshot)],
            subscription: Subscription::Replace(receiver),
        }
    }

    async fn leave_workspace(&self, session: SessionId, id: &WorkspaceId) {
        let Some(handle) = self.store.get(id).await else {
            return;
        };
        let mut workspace = handle.lock().await;
        self.presence.leave(&mut workspace, session);
        self.store.close_if_empty(&handle, &mut workspace).await;
    }

    async fn selection(&self, session: &Session, update: SelectionUpdate) -> Outcome {
        let Some(id) = session.active_workspace() else {
            return Outcome::default();
        };
        if let Some(handle) = self.store.get(id).await {
            let mut workspace = handle.lock().await;
            if !self.presence.update_selection(&mut workspace, session.id, update) {
                log::debug!("Ignored incomplete selection from {}", session.id);
            }
        }
        Outcome::default()
    }

    async fn text_change(&self, session: &Session, payload: Value) -> Outcome {
        let Some(id) = session.active_workspace() else {
            log::debug!("Dropping text-change from {} outside a workspace", session.id);
            return Outcome::default();
        };
        if let Some(handle) = self.store.get(id).await {
            let mut workspace = handle.lock().await;
            match self
                .sync
                .apply_and_broadcast(&mut workspace, session.id, session.open_file.as_deref(), payload)
            {
                Ok(outcome) => log::trace!("{} applied {} change(s) to {id}", session.id, outcome.applied),
                Err(e) => log::debug!("Dropped text-change from {}: {e}", session.id),
            }
        }
        Outcome::default()
    }

    async fn open_file(&self, connection: ConnectionId, session: &Session, path: String) -> Outcome {
        let Some(id) = session.active_workspace() else {
            return Outcome::error(ERR_NOT_JOINED);
        };
        if self.mode != WorkspaceMode::Tree {
            return Outcome::error(ERR_NO_TREE);
        }
        let workspace_dir = self.root.join(id.as_str());
        let Some(path) = path::canonical(&workspace_dir, &path, IdentifierKind::TreePath) else {
            log::warn!("Session {} asked for invalid file {path:?}", session.id);
            return Outcome::error(ERR_INVALID_FILE);
        };
        let Some(handle) = self.store.get(id).await else {
            return Outcome::error(ERR_NOT_JOINED);
        };

        let mut workspace = handle.lock().await;
        let Some(tree) = workspace.tree_mut() else {
            return Outcome::error(ERR_NO_TREE);
        };
        if !tree.open(&path, session.id) {
            return Outcome::error(format!("File not found: {path}"));
        }
        let Some(node) = tree.find(&path).cloned() else {
            return Outcome::error(format!("File not found: {path}"));
        };
        workspace.publish(
            &ServerMessage::UserOpenedFile(FileFocus {
                user_id: session.id,
                path: node.path.clone(),
            }),
            Audience::AllExcept(session.id),
        );
        drop(workspace);

        let canonical = node.path.clone();
        self.sessions
            .update(connection, |s| s.open_file = Some(canonical))
            .await;
        Outcome::reply(ServerMessage::FileOpened(node))
    }

    async fn save(&self, session: &Session) -> Outcome {
        let Some(id) = session.active_workspace() else {
            return Outcome::error(ERR_NOT_JOINED);
        };
        if !session.can_write {
            log::info!("Session {} tried to save {id} without write access", session.id);
            return Outcome::error(ERR_WRITE_REQUIRED);
        }
        if let Some(handle) = self.store.get(id).await {
            let mut workspace = handle.lock().await;
            self.sync.save(&mut workspace);
        }
        Outcome::default()
    }

    async fn custom_event(&self, connection: ConnectionId, session: &Session, event: CustomEvent) -> Outcome {
        let workspace = session.active_workspace();
        let ctx = EventContext {
            session: session.id,
            workspace,
            can_write: session.can_write,
        };
        let result = self.events.handle(&ctx, &event);

        if let Some(grant) = result.grant_write {
            self.sessions.update(connection, |s| s.can_write = grant).await;
            log::info!("Session {} write access set to {grant}", session.id);
        }
        if let Some(id) = workspace {
            for relay in result.broadcast {
                self.store
                    .publish(id, &ServerMessage::CustomEvent(relay), Some(session.id))
                    .await;
            }
        }

        Outcome {
            replies: result.replies.into_iter().map(ServerMessage::CustomEvent).collect(),
            subscription: Subscription::Keep,
        }
    }
}
