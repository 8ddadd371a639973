//! Thin websocket client speaking the editor protocol.
//!
//! Outgoing messages go through a channel drained by a writer task; incoming
//! frames are decoded by a reader task and surfaced as [`ClientEvent`]s on the
//! receiver returned by [`EditorClient::take_event_rx`].

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use tandem_core::ChangeRecord;

use crate::presence::Selection;
use crate::protocol::{ClientMessage, CustomEvent, JoinRequest, ProtocolError, SelectionUpdate, ServerMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Message(ServerMessage),
    Disconnected,
}

pub struct EditorClient {
    url: String,
    state: Arc<RwLock<ConnectionState>>,
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    event_tx: mpsc::Sender<ClientEvent>,
}

impl EditorClient {
    /// `url` is a websocket URL such as `ws://127.0.0.1:9090`.
    pub fn new(url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            url: url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver. Can only be called once.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::Text(frame.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ConnectionState::Connected;

        // Reader task: decode frames into events
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerMessage::decode(text.as_str()) {
                        Ok(server_msg) => {
                            if event_tx.send(ClientEvent::Message(server_msg)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::debug!("Ignoring undecodable frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Close the connection. The reader reports `Disconnected` once the
    /// server acknowledges.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }

    pub async fn send(&self, msg: &ClientMessage) -> Result<(), ProtocolError> {
        let frame = msg.encode()?;
        self.send_raw(frame).await
    }

    /// Send a frame as-is, bypassing encoding.
    pub async fn send_raw(&self, frame: impl Into<String>) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        tx.send(frame.into()).await.map_err(|_| ProtocolError::ConnectionClosed)
    }

    pub async fn join(&self, workspace: &str) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Join(JoinRequest::Workspace(workspace.to_string())))
            .await
    }

    pub async fn join_with_params(&self, workspace: &str, params: Value) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Join(JoinRequest::WithParams {
            workspace: workspace.to_string(),
            params,
        }))
        .await
    }

    /// Send one edit operation made of `changes`.
    pub async fn send_edit(&self, changes: Vec<ChangeRecord>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::TextChange(json!({ "changes": changes })))
            .await
    }

    pub async fn send_selection(&self, selection: Selection, secondary: Vec<Selection>) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::Selection(SelectionUpdate {
            selection: Some(selection),
            secondary_selections: Some(secondary),
        }))
        .await
    }

    pub async fn open_file(&self, path: &str) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::OpenFile(path.to_string())).await
    }

    pub async fn save(&self) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::SaveWorkspace).await
    }

    pub async fn custom_event(&self, name: &str, params: Value) -> Result<(), ProtocolError> {
        self.send(&ClientMessage::CustomEvent(CustomEvent::new(name, params)))
            .await
    }
}
