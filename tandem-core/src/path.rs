//! Identifier validation for workspace and file names.
//!
//! Every identifier received from a peer passes through here before it is
//! joined onto a filesystem root. Rejection is a plain `false` / `None`:
//! the caller refuses the action and tells the peer, nothing else changes.

use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;

/// Longest identifier accepted, in bytes.
pub const MAX_IDENTIFIER_LEN: usize = 255;

/// Which allow-list an identifier is checked against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    /// Relative path inside a workspace tree (`/` allowed).
    TreePath,
    /// A bare file name (no `/`).
    FileName,
}

impl IdentifierKind {
    fn pattern(self) -> &'static Regex {
        static TREE: OnceLock<Regex> = OnceLock::new();
        static FILE: OnceLock<Regex> = OnceLock::new();
        match self {
            IdentifierKind::TreePath => TREE.get_or_init(|| {
                Regex::new(r"^[A-Za-z0-9_./-]+$").expect("tree path pattern compiles")
            }),
            IdentifierKind::FileName => FILE.get_or_init(|| {
                Regex::new(r"^[A-Za-z0-9_.-]+$").expect("file name pattern compiles")
            }),
        }
    }
}

/// Check `candidate` against all identifier rules for `root`.
pub fn validate(root: &Path, candidate: &str, kind: IdentifierKind) -> bool {
    resolve(root, candidate, kind).is_some()
}

/// Resolve `candidate` to an absolute path strictly below `root`.
///
/// Returns `None` when the identifier is empty, too long, contains
/// characters outside the allow-list, or normalizes to a location that is
/// not a descendant of `root` (`..` traversal, absolute override, or the
/// root itself).
pub fn resolve(root: &Path, candidate: &str, kind: IdentifierKind) -> Option<PathBuf> {
    if candidate.is_empty() || candidate.len() > MAX_IDENTIFIER_LEN {
        return None;
    }
    if !kind.pattern().is_match(candidate) {
        log::debug!("Identifier {candidate:?} rejected by allow-list");
        return None;
    }

    let root = normalize(&std::path::absolute(root).ok()?);
    let resolved = normalize(&root.join(candidate));

    if resolved != root && resolved.starts_with(&root) {
        Some(resolved)
    } else {
        log::debug!("Identifier {candidate:?} escapes {}", root.display());
        None
    }
}

/// Resolve `candidate` and spell the result relative to `root`, with `/`
/// between components.
///
/// Every spelling of one location (`proj`, `./proj`, `proj/`, `x/../proj`)
/// gives the same string, so the result can key a registry.
pub fn canonical(root: &Path, candidate: &str, kind: IdentifierKind) -> Option<String> {
    let resolved = resolve(root, candidate, kind)?;
    let root = normalize(&std::path::absolute(root).ok()?);
    let parts = resolved
        .strip_prefix(&root)
        .ok()?
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    Some(parts.join("/"))
}

/// Lexical normalization: drops `.`, folds `..` into its parent.
///
/// Does not touch the filesystem, so symlinks are not followed.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(p) => out.push(p.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            Component::Normal(part) => out.push(part),
        }
    }
    out
}
