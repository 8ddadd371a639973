//! Pluggable policy: who may join a workspace, and what custom events do.

use serde_json::Value;

use tandem_core::{SessionId, WorkspaceId};

use crate::protocol::CustomEvent;

/// What a join attempt looks like to an [`AccessCheck`].
#[derive(Debug, Clone, Copy)]
pub struct JoinContext<'a> {
    pub session: SessionId,
    pub workspace: &'a WorkspaceId,
    /// Auth parameters sent with the join, if any.
    pub params: Option<&'a Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allow { can_write: bool },
    /// Rejected; the reason is shown to the client.
    Deny(String),
}

pub trait AccessCheck: Send + Sync {
    fn check_join(&self, ctx: &JoinContext<'_>) -> AccessDecision;
}

/// Lets everyone in, with a fixed write permission.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAccess {
    pub grant_write: bool,
}

impl AccessCheck for OpenAccess {
    fn check_join(&self, _ctx: &JoinContext<'_>) -> AccessDecision {
        AccessDecision::Allow {
            can_write: self.grant_write,
        }
    }
}

/// What the sender of a custom event looks like to an [`EventHandler`].
#[derive(Debug, Clone, Copy)]
pub struct EventContext<'a> {
    pub session: SessionId,
    pub workspace: Option<&'a WorkspaceId>,
    pub can_write: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventOutcome {
    /// Sent back to the sender.
    pub replies: Vec<CustomEvent>,
    /// Sent to the other members of the sender's workspace.
    pub broadcast: Vec<CustomEvent>,
    /// Change the sender's write permission.
    pub grant_write: Option<bool>,
}

impl EventOutcome {
    pub fn reply(event: CustomEvent) -> Self {
        Self {
            replies: vec![event],
            ..Self::default()
        }
    }
}

pub trait EventHandler: Send + Sync {
    fn handle(&self, ctx: &EventContext<'_>, event: &CustomEvent) -> EventOutcome;
}

/// Drops every custom event.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreEvents;

impl EventHandler for IgnoreEvents {
    fn handle(&self, ctx: &EventContext<'_>, event: &CustomEvent) -> EventOutcome {
        log::debug!("Ignoring custom event {} from {}", event.name, ctx.session);
        EventOutcome::default()
    }
}
