//! In-memory storage that records every save, for tests and embedding.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tandem_core::{FileNode, WorkspaceId};

use super::{scaffold_tree, PersistenceBridge, StorageError, DEFAULT_README};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stored {
    Text(String),
    Tree(FileNode),
}

/// One save call as it reached the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveRecord {
    pub workspace: WorkspaceId,
    pub content: Stored,
}

#[derive(Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<WorkspaceId, Stored>>,
    saves: Mutex<Vec<SaveRecord>>,
    fail_saves: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_text(self, id: &str, text: &str) -> Self {
        self.insert(WorkspaceId::new(id), Stored::Text(text.to_string()));
        self
    }

    pub fn with_tree(self, id: &str, tree: FileNode) -> Self {
        self.insert(WorkspaceId::new(id), Stored::Tree(tree));
        self
    }

    fn insert(&self, id: WorkspaceId, content: Stored) {
        if let Ok(mut docs) = self.documents.lock() {
            docs.insert(id, content);
        }
    }

    /// Current stored contents of a workspace.
    pub fn stored(&self, id: &str) -> Option<Stored> {
        let docs = self.documents.lock().ok()?;
        docs.get(&WorkspaceId::new(id)).cloned()
    }

    /// Every save so far, oldest first.
    pub fn saves(&self) -> Vec<SaveRecord> {
        self.saves.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn save_count(&self, id: &str) -> usize {
        self.saves().iter().filter(|s| s.workspace.as_str() == id).count()
    }

    /// Make subsequent saves fail (they are still recorded).
    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    fn record(&self, id: &WorkspaceId, content: Stored) -> Result<(), StorageError> {
        let mut saves = self
            .saves
            .lock()
            .map_err(|_| StorageError::Backend("save log poisoned".into()))?;
        saves.push(SaveRecord {
            workspace: id.clone(),
            content: content.clone(),
        });
        drop(saves);

        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StorageError::Backend(format!("save of {id} rejected")));
        }
        self.insert(id.clone(), content);
        Ok(())
    }

    fn load_or_insert(&self, id: &WorkspaceId, create: impl FnOnce() -> Stored) -> Result<Stored, StorageError> {
        let mut docs = self
            .documents
            .lock()
            .map_err(|_| StorageError::Backend("document map poisoned".into()))?;
        Ok(docs.entry(id.clone()).or_insert_with(create).clone())
    }
}

impl PersistenceBridge for MemoryStore {
    fn load_text(&self, id: &WorkspaceId) -> Result<String, StorageError> {
        match self.load_or_insert(id, || Stored::Text(String::new()))? {
            Stored::Text(text) => Ok(text),
            Stored::Tree(_) => Err(StorageError::Backend(format!("{id} is a tree workspace"))),
        }
    }

    fn save_text(&self, id: &WorkspaceId, text: &str) -> Result<(), StorageError> {
        self.record(id, Stored::Text(text.to_string()))
    }

    fn load_tree(&self, id: &WorkspaceId) -> Result<FileNode, StorageError> {
        match self.load_or_insert(id, || Stored::Tree(scaffold_tree(DEFAULT_README)))? {
            Stored::Tree(tree) => Ok(tree),
            Stored::Text(_) => Err(StorageError::Backend(format!("{id} is a text workspace"))),
        }
    }

    fn save_tree(&self, id: &WorkspaceId, tree: &FileNode) -> Result<(), StorageError> {
        self.record(id, Stored::Tree(tree.clone()))
    }
}
