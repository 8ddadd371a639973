//! Directory-backed storage.
//!
//! A single-buffer workspace is one file under the root; a tree workspace is
//! a directory under the root whose structure is mirrored into a
//! [`FileNode`] tree on load.

use std::fs;
use std::path::{Path, PathBuf};

use tandem_core::path::{resolve, IdentifierKind};
use tandem_core::{FileNode, WorkspaceId};

use super::{PersistenceBridge, StorageError, DEFAULT_README, README_NAME};

pub struct FsStore {
    root: PathBuf,
    readme: String,
}

impl FsStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            readme: DEFAULT_README.to_string(),
        }
    }

    /// Override the README written into new tree workspaces.
    pub fn with_readme(mut self, readme: impl Into<String>) -> Self {
        self.readme = readme.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn locate(&self, id: &WorkspaceId) -> Result<PathBuf, StorageError> {
        resolve(&self.root, id.as_str(), IdentifierKind::TreePath)
            .ok_or_else(|| StorageError::InvalidIdentifier(id.to_string()))
    }
}

impl PersistenceBridge for FsStore {
    fn load_text(&self, id: &WorkspaceId) -> Result<String, StorageError> {
        let path = self.locate(id)?;
        if !path.exists() {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;
            }
            fs::write(&path, "").map_err(|e| StorageError::io(&path, e))?;
            log::info!("Created workspace file {}", path.display());
            return Ok(String::new());
        }
        fs::read_to_string(&path).map_err(|e| StorageError::io(&path, e))
    }

    fn save_text(&self, id: &WorkspaceId, text: &str) -> Result<(), StorageError> {
        let path = self.locate(id)?;
        fs::write(&path, text).map_err(|e| StorageError::io(&path, e))
    }

    fn load_tree(&self, id: &WorkspaceId) -> Result<FileNode, StorageError> {
        let dir = self.locate(id)?;
        if !dir.exists() {
            fs::create_dir_all(&dir).map_err(|e| StorageError::io(&dir, e))?;
            let readme = dir.join(README_NAME);
            fs::write(&readme, &self.readme).map_err(|e| StorageError::io(&readme, e))?;
            log::info!("Created workspace directory {}", dir.display());
        }
        let name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(FileNode::directory(name, "", read_children(&dir, "")?))
    }

    fn save_tree(&self, id: &WorkspaceId, tree: &FileNode) -> Result<(), StorageError> {
        let dir = self.locate(id)?;
        let mut result = Ok(());
        tree.walk(&mut |node| {
            if result.is_err() {
                return;
            }
            result = write_node(&dir, node);
        });
        result
    }
}

fn read_children(dir: &Path, prefix: &str) -> Result<Vec<FileNode>, StorageError> {
    let entries = fs::read_dir(dir).map_err(|e| StorageError::io(dir, e))?;
    let mut children = Vec::new();

    for entry in entries {
        let entry = entry.map_err(|e| StorageError::io(dir, e))?;
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().into_owned();
        let rel = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        let meta = fs::symlink_metadata(&path).map_err(|e| StorageError::io(&path, e))?;
        let kind = meta.file_type();

        let node = if kind.is_symlink() {
            let target = fs::read_link(&path).map_err(|e| StorageError::io(&path, e))?;
            FileNode::symlink(name, rel, target.to_string_lossy())
        } else if kind.is_dir() {
            let nested = read_children(&path, &rel)?;
            FileNode::directory(name, rel, nested)
        } else if kind.is_file() {
            let bytes = fs::read(&path).map_err(|e| StorageError::io(&path, e))?;
            match String::from_utf8(bytes) {
                Ok(content) => FileNode::file(name, rel, content),
                Err(_) => {
                    log::debug!("Treating non-UTF-8 file {} as opaque", path.display());
                    FileNode::unknown(name, rel)
                }
            }
        } else {
            FileNode::unknown(name, rel)
        };
        children.push(node);
    }

    Ok(children)
}

fn write_node(dir: &Path, node: &FileNode) -> Result<(), StorageError> {
    if node.path.is_empty() {
        return Ok(());
    }
    let path = dir.join(&node.path);
    if node.is_directory() {
        fs::create_dir_all(&path).map_err(|e| StorageError::io(&path, e))
    } else if let (true, Some(content)) = (node.is_file(), node.content.as_deref()) {
        fs::write(&path, content).map_err(|e| StorageError::io(&path, e))
    } else {
        Ok(())
    }
}
