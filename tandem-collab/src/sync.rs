//! Text synchronization: apply an edit to the authoritative document, then
//! relay it.
//!
//! The engine runs with the workspace lock held, so every operation for a
//! workspace is applied and fanned out in one total order. The relayed frame
//! is the client's payload as received; peers apply it to their own copies.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use tandem_core::{EditError, EditOperation, SessionId};

use crate::broadcast::Audience;
use crate::protocol::ServerMessage;
use crate::storage::PersistenceBridge;
use crate::workspace::{Document, Workspace};

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Malformed(#[from] EditError),
    #[error("session {0} is not a member of the workspace")]
    NotMember(SessionId),
    #[error("workspace is closed")]
    Closed,
    #[error("no file is open")]
    NoOpenFile,
    #[error("{0} is not open by this session")]
    NotOpen(String),
}

/// What one applied operation did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SyncOutcome {
    /// Change records that took effect.
    pub applied: usize,
    /// Subscribers the relay reached, before audience filtering.
    pub subscribers: usize,
    /// Whether the interval flush ran.
    pub persisted: bool,
}

pub struct TextSyncEngine {
    bridge: Arc<dyn PersistenceBridge>,
    save_interval: Option<Duration>,
}

impl TextSyncEngine {
    /// `save_interval` enables flushing from the edit path; `None` leaves
    /// persistence to explicit saves and teardown.
    pub fn new(bridge: Arc<dyn PersistenceBridge>, save_interval: Option<Duration>) -> Self {
        Self { bridge, save_interval }
    }

    pub fn save_interval(&self) -> Option<Duration> {
        self.save_interval
    }

    /// Apply `payload` from `source` and relay it.
    ///
    /// In a text workspace the edit goes to the buffer and is relayed to
    /// every other member. In a tree workspace it goes to `open_file` and is
    /// relayed only to the other sessions holding that file open.
    pub fn apply_and_broadcast(
        &self,
        workspace: &mut Workspace,
        source: SessionId,
        open_file: Option<&str>,
        payload: Value,
    ) -> Result<SyncOutcome, SyncError> {
        if workspace.is_closed() {
            return Err(SyncError::Closed);
        }
        if !workspace.is_member(source) {
            return Err(SyncError::NotMember(source));
        }
        let op = EditOperation::from_value(&payload)?;
        let unit = workspace.unit();

        let (applied, audience) = match workspace.document_mut() {
            Document::Text(buf) => (buf.apply(&op), Audience::AllExcept(source)),
            Document::Tree(tree) => {
                let path = open_file.ok_or(SyncError::NoOpenFile)?;
                if !tree.holders(path).contains(&source) {
                    return Err(SyncError::NotOpen(path.to_string()));
                }
                let applied = tree
                    .apply_edit(path, &op, unit)
                    .ok_or_else(|| SyncError::NotOpen(path.to_string()))?;
                let others = tree.holders(path).iter().copied().filter(|s| *s != source).collect();
                (applied, Audience::Only(others))
            }
        };
        if applied > 0 {
            workspace.mark_dirty();
        }

        let subscribers = workspace.publish(&ServerMessage::TextChange(payload), audience);

        let persisted = match self.save_interval {
            Some(interval) if workspace.since_persist() >= interval => workspace.persist(self.bridge.as_ref()),
            _ => false,
        };

        Ok(SyncOutcome {
            applied,
            subscribers,
            persisted,
        })
    }

    /// Persist now, regardless of the interval.
    pub fn save(&self, workspace: &mut Workspace) -> bool {
        workspace.persist(self.bridge.as_ref())
    }
}
