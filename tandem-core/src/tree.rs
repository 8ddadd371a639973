//! In-memory mirror of a workspace directory.
//!
//! One [`FileNode`] per filesystem entry. Paths are relative to the
//! workspace root, `/`-separated, and the root node has the empty path.
//! File nodes carry the list of sessions holding them open; that list is
//! the authority for "who is looking at which file".

use serde::{Deserialize, Serialize};

use crate::buffer::{apply_operation, EditOperation, OffsetUnit};
use crate::ids::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
    Symlink,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileNode {
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub name: String,
    pub path: String,
    /// File contents (files only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Link target (symlinks only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Sessions that currently have this file open.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub open_by: Vec<SessionId>,
    /// Directory entries, ordered by name.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FileNode>,
}

impl FileNode {
    fn bare(kind: NodeKind, name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            path: path.into(),
            content: None,
            target: None,
            open_by: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn file(name: impl Into<String>, path: impl Into<String>, content: impl Into<String>) -> Self {
        let mut node = Self::bare(NodeKind::File, name, path);
        node.content = Some(content.into());
        node
    }

    /// A directory; children are sorted by name.
    pub fn directory(name: impl Into<String>, path: impl Into<String>, mut children: Vec<FileNode>) -> Self {
        children.sort_by(|a, b| a.name.cmp(&b.name));
        let mut node = Self::bare(NodeKind::Directory, name, path);
        node.children = children;
        node
    }

    pub fn symlink(name: impl Into<String>, path: impl Into<String>, target: impl Into<String>) -> Self {
        let mut node = Self::bare(NodeKind::Symlink, name, path);
        node.target = Some(target.into());
        node
    }

    pub fn unknown(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self::bare(NodeKind::Unknown, name, path)
    }

    pub fn is_file(&self) -> bool {
        self.kind == NodeKind::File
    }

    pub fn is_directory(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// Look up a node by relative path. `""` and `"."` name the root.
    pub fn find(&self, path: &str) -> Option<&FileNode> {
        let mut node = self;
        for part in components(path)? {
            node = node.children.iter().find(|c| c.name == part)?;
        }
        Some(node)
    }

    pub fn find_mut(&mut self, path: &str) -> Option<&mut FileNode> {
        let mut node = self;
        for part in components(path)? {
            node = node.children.iter_mut().find(|c| c.name == part)?;
        }
        Some(node)
    }

    /// Move `session` onto the file at `path`.
    ///
    /// The session is first released from every other node. Returns `false`
    /// (and changes nothing) if `path` does not name a file.
    pub fn open(&mut self, path: &str, session: SessionId) -> bool {
        if !self.find(path).is_some_and(FileNode::is_file) {
            return false;
        }
        self.release(session);
        if let Some(node) = self.find_mut(path) {
            node.open_by.push(session);
        }
        true
    }

    /// Remove `session` from every open-list in this subtree.
    pub fn release(&mut self, session: SessionId) {
        self.open_by.retain(|s| *s != session);
        for child in &mut self.children {
            child.release(session);
        }
    }

    /// Sessions holding the file at `path` open.
    pub fn holders(&self, path: &str) -> &[SessionId] {
        self.find(path).map(|n| n.open_by.as_slice()).unwrap_or(&[])
    }

    /// Apply an edit to the file at `path`. `None` if it is not a file.
    pub fn apply_edit(&mut self, path: &str, op: &EditOperation, unit: OffsetUnit) -> Option<usize> {
        let node = self.find_mut(path)?;
        if node.kind != NodeKind::File {
            return None;
        }
        let content = node.content.as_mut()?;
        Some(apply_operation(content, op, unit))
    }

    /// Depth-first visit of every node, root first.
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a FileNode)) {
        visit(self);
        for child in &self.children {
            child.walk(visit);
        }
    }

    pub fn file_count(&self) -> usize {
        let mut count = 0;
        self.walk(&mut |n| {
            if n.is_file() {
                count += 1;
            }
        });
        count
    }
}

/// Split a relative path into normalized components; `None` if it climbs
/// above the root.
fn components(path: &str) -> Option<Vec<&str>> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop()?;
            }
            name => parts.push(name),
        }
    }
    Some(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ChangeRecord;

    fn sample() -> FileNode {
        FileNode::directory(
            "",
            "",
            vec![
                FileNode::file("README.md", "README.md", "# Welcome"),
                FileNode::directory(
                    "src",
                    "src",
                    vec![
                        FileNode::file("main.rs", "src/main.rs", "fn main() {}"),
                        FileNode::symlink("lib.rs", "src/lib.rs", "main.rs"),
                    ],
                ),
            ],
        )
    }

    #[test]
    fn test_directory_children_sorted() {
        let root = sample();
        let src = root.find("src").unwrap();
        let names: Vec<&str> = src.children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["lib.rs", "main.rs"]);
    }

    #[test]
    fn test_find_by_path() {
        let root = sample();
        assert_eq!(root.find("src/main.rs").unwrap().content.as_deref(), Some("fn main() {}"));
        assert_eq!(root.find("").unwrap().kind, NodeKind::Directory);
        assert_eq!(root.find("src/../README.md").unwrap().name, "README.md");
        assert!(root.find("src/missing.rs").is_none());
        assert!(root.find("../outside").is_none());
    }

    #[test]
    fn test_open_moves_session_between_files() {
        let mut root = sample();
        let alice = SessionId(1);

        assert!(root.open("README.md", alice));
        assert_eq!(root.holders("README.md"), &[alice]);

        assert!(root.open("src/main.rs", alice));
        assert!(root.holders("README.md").is_empty());
        assert_eq!(root.holders("src/main.rs"), &[alice]);
    }

    #[test]
    fn test_open_rejects_non_files() {
        let mut root = sample();
        let alice = SessionId(1);
        root.open("README.md", alice);

        assert!(!root.open("src", alice));
        assert!(!root.open("src/lib.rs", alice));
        assert!(!root.open("nope.txt", alice));
        // Previous open file untouched on failure.
        assert_eq!(root.holders("README.md"), &[alice]);
    }

    #[test]
    fn test_release_clears_all_lists() {
        let mut root = sample();
        root.open("README.md", SessionId(1));
        root.open("README.md", SessionId(2));
        root.release(SessionId(1));
        assert_eq!(root.holders("README.md"), &[SessionId(2)]);
    }

    #[test]
    fn test_apply_edit_to_file() {
        let mut root = sample();
        let op = EditOperation::new(vec![ChangeRecord::insert(9, "!")]);
        assert_eq!(root.apply_edit("README.md", &op, OffsetUnit::Utf16), Some(1));
        assert_eq!(root.find("README.md").unwrap().content.as_deref(), Some("# Welcome!"));
        assert_eq!(root.apply_edit("src", &op, OffsetUnit::Utf16), None);
    }

    #[test]
    fn test_file_count() {
        assert_eq!(sample().file_count(), 2);
    }

    #[test]
    fn test_serialized_shape() {
        let node = FileNode::file("a.txt", "a.txt", "hi");
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["content"], "hi");
        assert!(json.get("children").is_none());
    }
}
