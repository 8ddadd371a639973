//! JSON wire protocol between editor clients and the server.
//!
//! Every frame is a websocket text message of the form
//! ```text
//! { "event": "<kebab-case name>", "data": <payload> }
//! ```
//! Event names and payload shapes follow what browser editors emit, so
//! selections use line/column ranges and text changes carry
//! `rangeOffset`/`rangeLength`/`text` records.
//!
//! `text-change` payloads are kept as raw JSON: the server parses the change
//! records for itself but relays the original message untouched.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use tandem_core::{FileNode, SessionId, WorkspaceId};

use crate::presence::{Presence, Selection};

/// Messages a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientMessage {
    Join(JoinRequest),
    Selection(SelectionUpdate),
    TextChange(Value),
    OpenFile(String),
    SaveWorkspace,
    CustomEvent(CustomEvent),
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ServerMessage {
    Connected,
    Workspace(WorkspaceSnapshot),
    Error(String),
    UserJoined(Presence),
    UserLeft(SessionId),
    Selection(SelectionChanged),
    TextChange(Value),
    FileOpened(FileNode),
    UserOpenedFile(FileFocus),
    CustomEvent(CustomEvent),
}

/// `join` payload: a bare workspace id, or an id with auth parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JoinRequest {
    Workspace(String),
    WithParams {
        workspace: String,
        #[serde(default)]
        params: Value,
    },
}

impl JoinRequest {
    pub fn workspace(&self) -> &str {
        match self {
            JoinRequest::Workspace(id) => id,
            JoinRequest::WithParams { workspace, .. } => workspace,
        }
    }

    pub fn params(&self) -> Option<&Value> {
        match self {
            JoinRequest::Workspace(_) => None,
            JoinRequest::WithParams { params, .. } => Some(params),
        }
    }
}

/// `selection` payload sent by a client.
///
/// Both fields are optional on the wire so that a message missing either one
/// still decodes; the presence tracker then ignores it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionUpdate {
    #[serde(default)]
    pub selection: Option<Selection>,
    #[serde(default)]
    pub secondary_selections: Option<Vec<Selection>>,
}

/// `selection` event relayed to the other members of a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionChanged {
    #[serde(rename = "userID")]
    pub user_id: SessionId,
    pub selection: Selection,
    pub secondary_selections: Vec<Selection>,
}

/// Tells the other members which file a user now has open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFocus {
    #[serde(rename = "userID")]
    pub user_id: SessionId,
    pub path: String,
}

/// Application-defined event passed through the server untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomEvent {
    pub name: String,
    #[serde(default)]
    pub params: Value,
}

impl CustomEvent {
    pub fn new(name: impl Into<String>, params: Value) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }
}

/// Full state sent to a session right after it joins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSnapshot {
    pub id: WorkspaceId,
    /// Buffer contents (single-buffer mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// File tree (tree mode).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filesystem: Option<FileNode>,
    /// Presences of the members already in the workspace.
    pub users: BTreeMap<SessionId, Presence>,
    /// The joining session's own presence.
    pub presence: Presence,
    /// Last persist time, milliseconds since the Unix epoch.
    pub last_save: u64,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(ProtocolError::Decode)
    }

    /// Wire name of the event.
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::Join(_) => "join",
            ClientMessage::Selection(_) => "selection",
            ClientMessage::TextChange(_) => "text-change",
            ClientMessage::OpenFile(_) => "open-file",
            ClientMessage::SaveWorkspace => "save-workspace",
            ClientMessage::CustomEvent(_) => "custom-event",
        }
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(ProtocolError::Decode)
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error(message.into())
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::Connected => "connected",
            ServerMessage::Workspace(_) => "workspace",
            ServerMessage::Error(_) => "error",
            ServerMessage::UserJoined(_) => "user-joined",
            ServerMessage::UserLeft(_) => "user-left",
            ServerMessage::Selection(_) => "selection",
            ServerMessage::TextChange(_) => "text-change",
            ServerMessage::FileOpened(_) => "file-opened",
            ServerMessage::UserOpenedFile(_) => "user-opened-file",
            ServerMessage::CustomEvent(_) => "custom-event",
        }
    }
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("deserialization error: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("connection timeout")]
    Timeout,
}
