//! Persistence for workspace contents.
//!
//! ```text
//! ┌──────────────────┐   load / save    ┌────────────────────────────┐
//! │ WorkspaceStore   │ ───────────────► │ dyn PersistenceBridge      │
//! │ (in-memory)      │                  │  FsStore     — directories │
//! └──────────────────┘                  │  MemoryStore — tests       │
//!                                       └────────────────────────────┘
//! ```
//!
//! Loading a workspace that does not exist yet creates it: an empty file in
//! single-buffer mode, or a directory holding a README in tree mode.

pub mod fs;
pub mod memory;

pub use fs::FsStore;
pub use memory::{MemoryStore, SaveRecord, Stored};

use std::io;
use std::path::PathBuf;

use tandem_core::{FileNode, WorkspaceId};

/// Name of the file placed in a freshly created tree workspace.
pub const README_NAME: &str = "README.md";

/// Contents of that file unless configured otherwise.
pub const DEFAULT_README: &str = "# Welcome to your new workspace!\n\nThis is a README file for your new workspace.";

/// Storage backend for workspace contents.
///
/// Calls for one workspace never overlap: a workspace is loaded once, on the
/// blocking pool, and saved only while it is locked.
pub trait PersistenceBridge: Send + Sync {
    /// Load a single-buffer workspace, creating an empty one if missing.
    fn load_text(&self, id: &WorkspaceId) -> Result<String, StorageError>;

    fn save_text(&self, id: &WorkspaceId, text: &str) -> Result<(), StorageError>;

    /// Load a tree workspace, scaffolding a new directory if missing.
    fn load_tree(&self, id: &WorkspaceId) -> Result<FileNode, StorageError>;

    /// Write every file node back. Directories are created as needed; other
    /// node kinds are left alone.
    fn save_tree(&self, id: &WorkspaceId, tree: &FileNode) -> Result<(), StorageError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("workspace id escapes the storage root: {0}")]
    InvalidIdentifier(String),
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }
}

/// The tree a new workspace starts with.
pub fn scaffold_tree(readme: &str) -> FileNode {
    FileNode::directory("", "", vec![FileNode::file(README_NAME, README_NAME, readme)])
}
