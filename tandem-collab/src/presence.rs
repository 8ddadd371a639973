//! Presence: who is in a workspace, their cursor color, and where their
//! selections are.
//!
//! ```text
//! join ──► PresenceTracker::join()      ──► user-joined  (others)
//! selection ► PresenceTracker::update() ──► selection    (others)
//! leave ─► PresenceTracker::leave()     ──► user-left    (others)
//! ```
//!
//! The tracker is stateless; presences live in the workspace they belong to
//! and are only touched while that workspace's lock is held.

use rand::seq::SliceRandom;
use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use tandem_core::SessionId;

use crate::broadcast::Audience;
use crate::protocol::{SelectionChanged, SelectionUpdate, ServerMessage};
use crate::workspace::Workspace;

// ───────────────────────────────────────────────────────────────────
// Core types
// ───────────────────────────────────────────────────────────────────

/// Line/column range in a buffer, 1-based as editors report them.
///
/// Fields the editor sends beyond the four range coordinates (selection
/// direction, cursor position) are kept in `extra` and relayed as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Selection {
    pub start_line_number: u32,
    pub start_column: u32,
    pub end_line_number: u32,
    pub end_column: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Selection {
    pub fn new(start_line: u32, start_column: u32, end_line: u32, end_column: u32) -> Self {
        Self {
            start_line_number: start_line,
            start_column,
            end_line_number: end_line,
            end_column,
            extra: Map::new(),
        }
    }

    /// Collapsed selection at one position.
    pub fn caret(line: u32, column: u32) -> Self {
        Self::new(line, column, line, column)
    }

    pub fn is_caret(&self) -> bool {
        self.start_line_number == self.end_line_number && self.start_column == self.end_column
    }
}

/// Cursor color. On the wire it is an `rgba(r, g, b, opacity)` template the
/// client fills in with its own alpha.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// Colors handed out to joining sessions.
pub const PALETTE: [CursorColor; 12] = [
    CursorColor::rgb(255, 0, 0),
    CursorColor::rgb(255, 127, 0),
    CursorColor::rgb(255, 255, 0),
    CursorColor::rgb(255, 0, 127),
    CursorColor::rgb(255, 0, 255),
    CursorColor::rgb(0, 255, 0),
    CursorColor::rgb(127, 255, 0),
    CursorColor::rgb(0, 255, 127),
    CursorColor::rgb(0, 255, 255),
    CursorColor::rgb(0, 0, 255),
    CursorColor::rgb(127, 0, 255),
    CursorColor::rgb(0, 127, 255),
];

const OPACITY_PLACEHOLDER: &str = "opacity";

impl CursorColor {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// `rgba(r, g, b, opacity)`
    pub fn template(&self) -> String {
        format!("rgba({}, {}, {}, {OPACITY_PLACEHOLDER})", self.r, self.g, self.b)
    }

    /// Template with the placeholder filled in.
    pub fn with_alpha(&self, alpha: f32) -> String {
        format!("rgba({}, {}, {}, {alpha})", self.r, self.g, self.b)
    }

    fn parse(template: &str) -> Option<Self> {
        let inner = template.trim().strip_prefix("rgba(")?.strip_suffix(')')?;
        let mut parts = inner.split(',').map(str::trim);
        let r = parts.next()?.parse().ok()?;
        let g = parts.next()?.parse().ok()?;
        let b = parts.next()?.parse().ok()?;
        if parts.next()? != OPACITY_PLACEHOLDER || parts.next().is_some() {
            return None;
        }
        Some(Self { r, g, b })
    }
}

impl Default for CursorColor {
    fn default() -> Self {
        PALETTE[0]
    }
}

impl fmt::Display for CursorColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.template())
    }
}

impl Serialize for CursorColor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.template())
    }
}

impl<'de> Deserialize<'de> for CursorColor {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        CursorColor::parse(&raw).ok_or_else(|| de::Error::custom(format!("invalid color template: {raw}")))
    }
}

/// What the other members know about one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub id: SessionId,
    pub color: CursorColor,
    /// `None` until the first selection update arrives.
    pub selection: Option<Selection>,
    #[serde(default)]
    pub secondary_selections: Vec<Selection>,
}

impl Presence {
    pub fn new(id: SessionId, color: CursorColor) -> Self {
        Self {
            id,
            color,
            selection: None,
            secondary_selections: Vec::new(),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Tracker
// ───────────────────────────────────────────────────────────────────

/// Maintains presences inside a locked [`Workspace`] and announces changes.
#[derive(Debug, Clone)]
pub struct PresenceTracker {
    palette: Vec<CursorColor>,
}

impl Default for PresenceTracker {
    fn default() -> Self {
        Self::with_palette(PALETTE.to_vec())
    }
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty palette falls back to the default color.
    pub fn with_palette(palette: Vec<CursorColor>) -> Self {
        Self { palette }
    }

    pub fn palette(&self) -> &[CursorColor] {
        &self.palette
    }

    fn pick_color(&self) -> CursorColor {
        self.palette
            .choose(&mut rand::thread_rng())
            .copied()
            .unwrap_or_default()
    }

    /// Register `session` with a random color and announce it to the
    /// members already present.
    pub fn join(&self, workspace: &mut Workspace, session: SessionId) -> Presence {
        let presence = Presence::new(session, self.pick_color());
        workspace.users_mut().insert(session, presence.clone());
        workspace.publish(
            &ServerMessage::UserJoined(presence.clone()),
            Audience::AllExcept(session),
        );
        log::debug!("{} joined {} as {}", session, workspace.id(), presence.color);
        presence
    }

    /// Drop `session`'s presence, release any file it holds, and announce the
    /// departure. Returns `false` if it was not a member.
    pub fn leave(&self, workspace: &mut Workspace, session: SessionId) -> bool {
        if workspace.users_mut().remove(&session).is_none() {
            return false;
        }
        if let Some(tree) = workspace.tree_mut() {
            tree.release(session);
        }
        workspace.publish(&ServerMessage::UserLeft(session), Audience::AllExcept(session));
        log::debug!("{} left {}", session, workspace.id());
        true
    }

    /// Replace `session`'s selections and relay them to the others.
    ///
    /// Updates missing either selection field, or from a non-member, are
    /// ignored.
    pub fn update_selection(&self, workspace: &mut Workspace, session: SessionId, update: SelectionUpdate) -> bool {
        let (Some(selection), Some(secondary)) = (update.selection, update.secondary_selections) else {
            return false;
        };
        let Some(presence) = workspace.users_mut().get_mut(&session) else {
            return false;
        };
        presence.selection = Some(selection.clone());
        presence.secondary_selections = secondary.clone();

        workspace.publish(
            &ServerMessage::Selection(SelectionChanged {
                user_id: session,
                selection,
                secondary_selections: secondary,
            }),
            Audience::AllExcept(session),
        );
        true
    }
}
