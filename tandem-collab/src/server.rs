//! WebSocket server.
//!
//! ```text
//! Client A ──┐                         ┌── WorkspaceStore ── Workspace ── BroadcastGroup
//!            ├── SyncServer ── Gateway ┤                        │
//! Client B ──┘   (one task per         └── PersistenceBridge    ▼
//!                 connection)              (FsStore)         Client A, B, C
//! ```
//!
//! Each connection task reads JSON text frames, hands them to the
//! [`SessionGateway`], writes the replies back, and forwards envelopes from
//! its workspace's broadcast channel that are addressed to it. A background
//! task periodically flushes idle workspaces with unsaved edits.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use tandem_core::{OffsetUnit, SessionId};

use crate::broadcast::Envelope;
use crate::gateway::{SessionGateway, Subscription};
use crate::hooks::OpenAccess;
use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use crate::session::ConnectionId;
use crate::storage::{FsStore, PersistenceBridge, DEFAULT_README};
use crate::workspace::{WorkspaceMode, WorkspaceStore};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Directory holding the workspaces
    pub workspace_root: PathBuf,
    pub mode: WorkspaceMode,
    /// Broadcast channel capacity per workspace
    pub broadcast_capacity: usize,
    /// Minimum age of the last persist before an edit or the idle sweep
    /// writes again
    pub save_interval: Duration,
    /// Period of the idle sweep
    pub autosave_tick: Duration,
    pub offset_unit: OffsetUnit,
    /// Write permission granted on join by the default access policy
    pub grant_write: bool,
    /// README written into new tree workspaces
    pub readme_template: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            workspace_root: PathBuf::from("workspaces"),
            mode: WorkspaceMode::Single,
            broadcast_capacity: 256,
            save_interval: Duration::from_secs(10),
            autosave_tick: Duration::from_secs(5),
            offset_unit: OffsetUnit::Utf16,
            grant_write: false,
            readme_template: DEFAULT_README.to_string(),
        }
    }
}

impl ServerConfig {
    /// Ephemeral port, short sweep period.
    pub fn for_testing(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            workspace_root: workspace_root.into(),
            autosave_tick: Duration::from_millis(50),
            ..Self::default()
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub malformed_messages: u64,
    pub lagged_messages: u64,
    /// Fresh snapshots sent to connections that fell behind
    pub resyncs: u64,
    pub autosaves: u64,
    pub active_workspaces: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    gateway: Arc<SessionGateway>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Directory-backed server with the open access policy.
    pub fn new(config: ServerConfig) -> Self {
        let bridge = FsStore::new(&config.workspace_root).with_readme(config.readme_template.clone());
        Self::with_bridge(config, Arc::new(bridge))
    }

    pub fn with_bridge(config: ServerConfig, bridge: Arc<dyn PersistenceBridge>) -> Self {
        let store = Arc::new(WorkspaceStore::new(
            bridge,
            config.mode,
            config.offset_unit,
            config.broadcast_capacity,
        ));
        let gateway = SessionGateway::new(&config.workspace_root, store, config.save_interval).with_access(Arc::new(
            OpenAccess {
                grant_write: config.grant_write,
            },
        ));
        Self::with_gateway(config, gateway)
    }

    /// Use a gateway configured with custom hooks.
    pub fn with_gateway(config: ServerConfig, gateway: SessionGateway) -> Self {
        Self {
            config,
            gateway: Arc::new(gateway),
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn gateway(&self) -> &Arc<SessionGateway> {
        &self.gateway
    }

    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        TcpListener::bind(&self.config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: self.config.bind_addr.clone(),
                source,
            })
    }

    /// Bind the configured address and serve until accept fails.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        match listener.local_addr() {
            Ok(addr) => log::info!("Sync server listening on {addr} ({:?} mode)", self.config.mode),
            Err(_) => log::info!("Sync server listening on {}", self.config.bind_addr),
        }
        let autosave = self.spawn_autosave();

        let result = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(ServerError::Accept(e)),
            };
            log::debug!("New TCP connection from {addr}");

            let gateway = self.gateway.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, gateway, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        };

        autosave.abort();
        self.shutdown().await;
        result
    }

    /// Persist every workspace with unsaved edits.
    pub async fn shutdown(&self) -> usize {
        let flushed = self.gateway.store().flush_all().await;
        log::info!("Flushed {flushed} workspace(s)");
        flushed
    }

    fn spawn_autosave(&self) -> JoinHandle<()> {
        let store = self.gateway.store().clone();
        let stats = self.stats.clone();
        let max_age = self.config.save_interval;
        let tick = self.config.autosave_tick.max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let flushed = store.flush_idle(max_age).await;
                if flushed > 0 {
                    log::debug!("Autosaved {flushed} idle workspace(s)");
                    stats.write().await.autosaves += flushed as u64;
                }
            }
        })
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        gateway: Arc<SessionGateway>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let connection = ConnectionId::new();
        let session = gateway.connect(connection).await;
        log::info!("WebSocket connection established from {addr} as session {session}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::pump(
            &mut ws_sender,
            &mut ws_receiver,
            addr,
            connection,
            session,
            &gateway,
            &stats,
        )
        .await;

        // Leave the workspace even if the socket failed.
        gateway.disconnect(connection).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        result
    }

    async fn pump(
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        addr: SocketAddr,
        connection: ConnectionId,
        session: SessionId,
        gateway: &SessionGateway,
        stats: &RwLock<ServerStats>,
    ) -> Result<(), ServerError> {
        let mut broadcast_rx: Option<broadcast::Receiver<Arc<Envelope>>> = None;
        send(ws_sender, &ServerMessage::Connected).await?;

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            match ClientMessage::decode(text.as_str()) {
                                Ok(client_msg) => {
                                    log::trace!("{} from session {session}", client_msg.event_name());
                                    let outcome = gateway.handle(connection, client_msg).await;
                                    for reply in &outcome.replies {
                                        send(ws_sender, reply).await?;
                                    }
                                    match outcome.subscription {
                                        Subscription::Keep => {}
                                        Subscription::Replace(rx) => broadcast_rx = Some(rx),
                                        Subscription::Drop => broadcast_rx = None,
                                    }
                                }
                                Err(e) => {
                                    log::debug!("Dropping malformed frame from {addr}: {e}");
                                    stats.write().await.malformed_messages += 1;
                                }
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            log::debug!("Ignoring binary frame from {addr}");
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::info!("Connection closed from {addr}");
                            break;
                        }

                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing broadcast
                msg = async {
                    if let Some(ref mut rx) = broadcast_rx {
                        rx.recv().await
                    } else {
                        // Not in a workspace yet
                        std::future::pending().await
                    }
                } => {
                    match msg {
                        Ok(envelope) => {
                            if envelope.is_for(session) {
                                ws_sender.send(Message::Text(envelope.frame.clone().into())).await?;
                            }
                        }
                        Err(RecvError::Lagged(n)) => {
                            // Skipped edits would leave the client's buffer behind for good.
                            log::warn!("Session {session} lagged by {n} messages, resyncing");
                            {
                                let mut s = stats.write().await;
                                s.lagged_messages += n;
                                s.resyncs += 1;
                            }
                            gateway.record_lag(connection, n).await;
                            match gateway.resync(connection).await {
                                Some((snapshot, rx)) => {
                                    broadcast_rx = Some(rx);
                                    send(ws_sender, &snapshot).await?;
                                }
                                None => broadcast_rx = None,
                            }
                        }
                        Err(RecvError::Closed) => broadcast_rx = None,
                    }
                }
            }
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_workspaces = self.gateway.store().len().await;
        stats
    }
}

async fn send(ws_sender: &mut WsSink, msg: &ServerMessage) -> Result<(), ServerError> {
    ws_sender.send(Message::Text(msg.encode()?.into())).await?;
    Ok(())
}
