//! # tandem-core — document model for Tandem
//!
//! Transport-free building blocks shared by the collaboration server:
//!
//! - [`path`] — identifier validation against traversal and injection
//! - [`buffer`] — text buffer and offset-based edit operations
//! - [`tree`] — file-tree mirror of a workspace directory
//! - [`ids`] — session and workspace identifiers

pub mod buffer;
pub mod ids;
pub mod path;
pub mod tree;

pub use buffer::{ChangeRecord, EditError, EditOperation, OffsetUnit, TextBuffer};
pub use ids::{SessionId, WorkspaceId};
pub use path::{IdentifierKind, MAX_IDENTIFIER_LEN};
pub use tree::{FileNode, NodeKind};
