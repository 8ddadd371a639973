//! Live workspaces and the registry that owns them.
//!
//! Each [`Workspace`] sits behind its own `tokio::sync::Mutex`; holding that
//! lock is what serializes edits, presence changes and persistence for the
//! workspace. The [`WorkspaceStore`] maps ids to handles and is only ever
//! locked briefly; loads from storage happen outside it on the blocking
//! pool. Lock order is workspace first, then store.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, Mutex, MutexGuard, OnceCell, RwLock};

use tandem_core::{FileNode, OffsetUnit, SessionId, TextBuffer, WorkspaceId};

use crate::broadcast::{Audience, BroadcastGroup, Envelope};
use crate::presence::Presence;
use crate::protocol::{ServerMessage, WorkspaceSnapshot};
use crate::storage::{PersistenceBridge, StorageError};

/// How workspace ids map onto storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceMode {
    /// One text buffer per workspace, stored as a single file.
    #[default]
    Single,
    /// A directory of files per workspace.
    Tree,
}

/// Authoritative contents of a workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Document {
    Text(TextBuffer),
    Tree(FileNode),
}

pub struct Workspace {
    id: WorkspaceId,
    document: Document,
    unit: OffsetUnit,
    users: BTreeMap<SessionId, Presence>,
    broadcast: BroadcastGroup,
    last_persist: SystemTime,
    dirty: bool,
    closed: bool,
}

impl Workspace {
    pub fn new(id: WorkspaceId, document: Document, unit: OffsetUnit, broadcast_capacity: usize) -> Self {
        Self {
            id,
            document,
            unit,
            users: BTreeMap::new(),
            broadcast: BroadcastGroup::new(broadcast_capacity),
            last_persist: SystemTime::now(),
            dirty: false,
            closed: false,
        }
    }

    pub fn id(&self) -> &WorkspaceId {
        &self.id
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub(crate) fn document_mut(&mut self) -> &mut Document {
        &mut self.document
    }

    /// Buffer contents in single-buffer mode.
    pub fn text(&self) -> Option<&str> {
        match &self.document {
            Document::Text(buf) => Some(buf.as_str()),
            Document::Tree(_) => None,
        }
    }

    pub fn tree(&self) -> Option<&FileNode> {
        match &self.document {
            Document::Tree(tree) => Some(tree),
            Document::Text(_) => None,
        }
    }

    pub(crate) fn tree_mut(&mut self) -> Option<&mut FileNode> {
        match &mut self.document {
            Document::Tree(tree) => Some(tree),
            Document::Text(_) => None,
        }
    }

    pub fn unit(&self) -> OffsetUnit {
        self.unit
    }

    pub fn users(&self) -> &BTreeMap<SessionId, Presence> {
        &self.users
    }

    pub(crate) fn users_mut(&mut self) -> &mut BTreeMap<SessionId, Presence> {
        &mut self.users
    }

    pub fn is_member(&self, session: SessionId) -> bool {
        self.users.contains_key(&session)
    }

    pub fn last_persist(&self) -> SystemTime {
        self.last_persist
    }

    /// Whether there are edits not yet persisted.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Set once the last member has left; a closed workspace accepts nothing.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Envelope>> {
        self.broadcast.subscribe()
    }

    pub fn broadcast(&self) -> &BroadcastGroup {
        &self.broadcast
    }

    /// Fan a message out to this workspace's subscribers.
    pub fn publish(&self, msg: &ServerMessage, audience: Audience) -> usize {
        match self.broadcast.publish(msg, audience) {
            Ok(count) => count,
            Err(e) => {
                log::error!("Failed to encode {} for {}: {e}", msg.event_name(), self.id);
                0
            }
        }
    }

    /// State sent to `session` when it joins. Its own presence is reported
    /// separately from the other members'.
    pub fn snapshot(&self, session: SessionId, presence: Presence) -> WorkspaceSnapshot {
        let users = self
            .users
            .iter()
            .filter(|(id, _)| **id != session)
            .map(|(id, p)| (*id, p.clone()))
            .collect();
        WorkspaceSnapshot {
            id: self.id.clone(),
            text: self.text().map(str::to_string),
            filesystem: self.tree().cloned(),
            users,
            presence,
            last_save: epoch_millis(self.last_persist),
        }
    }

    /// Write the document through `bridge`. Failures are logged and leave the
    /// workspace dirty.
    pub(crate) fn persist(&mut self, bridge: &dyn PersistenceBridge) -> bool {
        let result = match &self.document {
            Document::Text(buf) => bridge.save_text(&self.id, buf.as_str()),
            Document::Tree(tree) => bridge.save_tree(&self.id, tree),
        };
        match result {
            Ok(()) => {
                self.last_persist = SystemTime::now();
                self.dirty = false;
                log::debug!("Persisted workspace {}", self.id);
                true
            }
            Err(e) => {
                log::error!("Failed to persist workspace {}: {e}", self.id);
                false
            }
        }
    }

    pub(crate) fn touch(&mut self) {
        self.last_persist = SystemTime::now();
    }

    /// Time since the last persist (zero if the clock went backwards).
    pub fn since_persist(&self) -> Duration {
        self.last_persist.elapsed().unwrap_or_default()
    }
}

fn epoch_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Shared, lockable workspace.
pub struct WorkspaceHandle {
    id: WorkspaceId,
    state: Mutex<Workspace>,
}

impl WorkspaceHandle {
    pub fn id(&self) -> &WorkspaceId {
        &self.id
    }

    pub async fn lock(&self) -> MutexGuard<'_, Workspace> {
        self.state.lock().await
    }
}

/// A registry entry. Filled once the workspace has loaded; joiners that
/// arrive during the load wait on the same cell.
type Slot = Arc<OnceCell<Arc<WorkspaceHandle>>>;

/// Registry of live workspaces, keyed by id.
pub struct WorkspaceStore {
    workspaces: RwLock<HashMap<WorkspaceId, Slot>>,
    bridge: Arc<dyn PersistenceBridge>,
    mode: WorkspaceMode,
    unit: OffsetUnit,
    broadcast_capacity: usize,
}

impl WorkspaceStore {
    pub fn new(bridge: Arc<dyn PersistenceBridge>, mode: WorkspaceMode, unit: OffsetUnit, broadcast_capacity: usize) -> Self {
        Self {
            workspaces: RwLock::new(HashMap::new()),
            bridge,
            mode,
            unit,
            broadcast_capacity,
        }
    }

    pub fn mode(&self) -> WorkspaceMode {
        self.mode
    }

    pub fn unit(&self) -> OffsetUnit {
        self.unit
    }

    pub fn bridge(&self) -> &Arc<dyn PersistenceBridge> {
        &self.bridge
    }

    /// Return the live workspace for `id`, loading it from storage on first
    /// use. Concurrent first joins share a single load, and the load runs
    /// without the registry locked.
    pub async fn get_or_create(&self, id: &WorkspaceId) -> Result<Arc<WorkspaceHandle>, StorageError> {
        // Fast path: read lock
        let existing = self.workspaces.read().await.get(id).cloned();
        let slot = match existing {
            Some(slot) => slot,
            None => self.workspaces.write().await.entry(id.clone()).or_default().clone(),
        };
        if let Some(handle) = slot.get() {
            return Ok(handle.clone());
        }

        let result = slot.get_or_try_init(|| self.load(id)).await.cloned();
        if result.is_err() {
            self.forget_failed(id, slot).await;
        }
        result
    }

    async fn load(&self, id: &WorkspaceId) -> Result<Arc<WorkspaceHandle>, StorageError> {
        let bridge = self.bridge.clone();
        let (mode, unit, key) = (self.mode, self.unit, id.clone());
        let document = tokio::task::spawn_blocking(move || match mode {
            WorkspaceMode::Single => bridge
                .load_text(&key)
                .map(|text| Document::Text(TextBuffer::new(text, unit))),
            WorkspaceMode::Tree => bridge.load_tree(&key).map(Document::Tree),
        })
        .await
        .map_err(|e| StorageError::Backend(format!("load of {id} did not finish: {e}")))??;

        log::info!("Loaded workspace {id}");
        Ok(Arc::new(WorkspaceHandle {
            id: id.clone(),
            state: Mutex::new(Workspace::new(id.clone(), document, self.unit, self.broadcast_capacity)),
        }))
    }

    /// Drop the entry of a failed load unless another joiner still holds it
    /// and will retry.
    async fn forget_failed(&self, id: &WorkspaceId, slot: Slot) {
        let mut workspaces = self.workspaces.write().await;
        let unused = workspaces
            .get(id)
            .is_some_and(|current| Arc::ptr_eq(current, &slot) && current.get().is_none());
        // One reference from the map, one from `slot`.
        if unused && Arc::strong_count(&slot) == 2 {
            workspaces.remove(id);
        }
    }

    pub async fn get(&self, id: &WorkspaceId) -> Option<Arc<WorkspaceHandle>> {
        self.workspaces.read().await.get(id).and_then(|slot| slot.get().cloned())
    }

    pub async fn contains(&self, id: &WorkspaceId) -> bool {
        self.get(id).await.is_some()
    }

    pub async fn len(&self) -> usize {
        self.handles().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn ids(&self) -> Vec<WorkspaceId> {
        self.handles().await.iter().map(|h| h.id().clone()).collect()
    }

    async fn handles(&self) -> Vec<Arc<WorkspaceHandle>> {
        self.workspaces
            .read()
            .await
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect()
    }

    /// Tear down a workspace whose last member just left: persist it exactly
    /// once, mark it closed and drop it from the registry.
    ///
    /// `workspace` must be the locked contents of `handle`. Returns `false`
    /// if members remain or it was already closed.
    pub async fn close_if_empty(&self, handle: &Arc<WorkspaceHandle>, workspace: &mut Workspace) -> bool {
        if workspace.closed || !workspace.users.is_empty() {
            return false;
        }
        workspace.persist(self.bridge.as_ref());
        workspace.closed = true;

        let mut workspaces = self.workspaces.write().await;
        let current = workspaces
            .get(handle.id())
            .and_then(|slot| slot.get())
            .is_some_and(|h| Arc::ptr_eq(h, handle));
        if current {
            workspaces.remove(handle.id());
        }
        log::info!("Closed workspace {}", handle.id());
        true
    }

    /// Send `msg` to every member of `id`, optionally skipping one.
    pub async fn publish(&self, id: &WorkspaceId, msg: &ServerMessage, exclude: Option<SessionId>) -> usize {
        let Some(handle) = self.get(id).await else {
            return 0;
        };
        let workspace = handle.lock().await;
        let audience = match exclude {
            Some(session) => Audience::AllExcept(session),
            None => Audience::Everyone,
        };
        workspace.publish(msg, audience)
    }

    /// Reset the persist clock of `id` without writing anything.
    pub async fn touch(&self, id: &WorkspaceId) -> bool {
        let Some(handle) = self.get(id).await else {
            return false;
        };
        handle.lock().await.touch();
        true
    }

    /// Persist every dirty workspace not written for at least `max_age`.
    /// Returns how many were written.
    pub async fn flush_idle(&self, max_age: Duration) -> usize {
        let mut flushed = 0;
        for handle in self.handles().await {
            let mut workspace = handle.lock().await;
            if workspace.closed || !workspace.dirty || workspace.since_persist() < max_age {
                continue;
            }
            if workspace.persist(self.bridge.as_ref()) {
                flushed += 1;
            }
        }
        flushed
    }

    /// Persist every dirty workspace, e.g. on shutdown.
    pub async fn flush_all(&self) -> usize {
        self.flush_idle(Duration::ZERO).await
    }
}
