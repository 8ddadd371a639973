//! # tandem-collab — real-time shared editing server
//!
//! Many editor clients connect over WebSocket, join a named workspace, and
//! see each other's edits and cursors live.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   JSON frames    ┌──────────────┐
//! │ EditorClient │ ◄──────────────► │ SyncServer   │
//! └──────────────┘                  └──────┬───────┘
//!                                          │
//!                                   ┌──────┴────────┐
//!                                   │ SessionGateway│
//!                                   └──────┬────────┘
//!                   ┌──────────────────────┼─────────────────────┐
//!                   ▼                      ▼                     ▼
//!            PresenceTracker        TextSyncEngine        WorkspaceStore
//!                   └──────────► Workspace (locked) ◄──────────┘ │
//!                                   │                            ▼
//!                              BroadcastGroup            PersistenceBridge
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol (`{"event", "data"}` frames)
//! - [`broadcast`] — per-workspace fan-out with audience filtering
//! - [`presence`] — cursor colors and selections
//! - [`workspace`] — live workspaces and their registry
//! - [`sync`] — apply-then-relay of edit operations
//! - [`session`] — per-connection state
//! - [`hooks`] — access checks and custom-event handling
//! - [`gateway`] — message routing and capability checks
//! - [`storage`] — persistence bridge (filesystem, in-memory)
//! - [`server`] — WebSocket server
//! - [`client`] — WebSocket client

pub mod broadcast;
pub mod client;
pub mod gateway;
pub mod hooks;
pub mod presence;
pub mod protocol;
pub mod server;
pub mod session;
pub mod storage;
pub mod sync;
pub mod workspace;

// Re-exports for convenience
pub use broadcast::{Audience, BroadcastGroup, BroadcastStats, Envelope};
pub use client::{ClientEvent, ConnectionState, EditorClient};
pub use gateway::{Outcome, SessionGateway, Subscription};
pub use hooks::{
    AccessCheck, AccessDecision, EventContext, EventHandler, EventOutcome, IgnoreEvents, JoinContext, OpenAccess,
};
pub use presence::{CursorColor, Presence, PresenceTracker, Selection, PALETTE};
pub use protocol::{
    ClientMessage, CustomEvent, FileFocus, JoinRequest, ProtocolError, SelectionChanged, SelectionUpdate,
    ServerMessage, WorkspaceSnapshot,
};
pub use server::{ServerConfig, ServerError, ServerStats, SyncServer};
pub use session::{ConnectionId, Session, SessionState};
pub use storage::{FsStore, MemoryStore, PersistenceBridge, StorageError};
pub use sync::{SyncError, SyncOutcome, TextSyncEngine};
pub use workspace::{Document, Workspace, WorkspaceHandle, WorkspaceMode, WorkspaceStore};
