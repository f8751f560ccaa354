//! WebSocket server for collaborative code rooms.
//!
//! Architecture:
//! ```text
//! Client A ──┐                      ┌── PresenceTracker ──┐
//!             ├── ConnectionGateway ─┼── EditReconciler ───┼── SessionStore ── Room ── BroadcastGroup
//! Client B ──┘                      └── ExecutionDispatcher┘        │                      │
//!                                          │                        │            ┌─────────┼─────────┐
//!                                    SandboxExecutor          RoomArchive        ▼         ▼         ▼
//!                                                          (RocksDB, LZ4)     Client A  Client B  Client C
//! ```
//!
//! Each connection runs one task. Inbound frames are decoded (JSON text or
//! bincode binary) and routed through the gateway; room deliveries are
//! filtered by audience and written back in the format the client last
//! used.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::auth::TokenVerifier;
use crate::execution::{ExecutionConfig, ExecutionDispatcher};
use crate::gateway::{malformed, ConnectionGateway, ConnectionState};
use crate::presence::{PresenceConfig, PresenceTracker};
use crate::protocol::{ClientMessage, ConnectionId, ServerMessage, WireFormat, WireFrame};
use crate::reconcile::EditReconciler;
use crate::room::RoomDefaults;
use crate::sandbox::SandboxExecutor;
use crate::session::{SessionConfig, SessionStore};
use crate::storage::{ArchiveConfig, ArchiveError, RoomArchive};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
    /// Accepted operations kept per room for rebasing late deltas
    pub history_limit: usize,
    /// How long an empty room survives
    pub eviction_grace: Duration,
    /// How long a dropped participant may reconnect before others see it leave
    pub reconnect_window: Duration,
    /// How long a typing hint lasts without a refresh
    pub typing_ttl: Duration,
    /// Upper bound on one code run
    pub execution_timeout: Duration,
    /// Bytes of stdout/stderr forwarded per run
    pub max_output_bytes: usize,
    /// Largest buffer an edit may produce (None = unlimited)
    pub max_buffer_bytes: Option<usize>,
    /// Applied to newly created rooms
    pub room_defaults: RoomDefaults,
    /// Archive path for evicted rooms (None = in-memory only)
    pub archive_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            broadcast_capacity: 256,
            history_limit: 1024,
            eviction_grace: Duration::from_secs(30),
            reconnect_window: Duration::from_secs(5),
            typing_ttl: Duration::from_secs(3),
            execution_timeout: Duration::from_secs(10),
            max_output_bytes: 64 * 1024,
            max_buffer_bytes: Some(1024 * 1024),
            room_defaults: RoomDefaults::default(),
            archive_path: None,
        }
    }
}

impl ServerConfig {
    fn session(&self) -> SessionConfig {
        SessionConfig {
            broadcast_capacity: self.broadcast_capacity,
            history_limit: self.history_limit,
            eviction_grace: self.eviction_grace,
        }
    }

    fn presence(&self) -> PresenceConfig {
        PresenceConfig {
            defaults: self.room_defaults.clone(),
            typing_ttl: self.typing_ttl,
            reconnect_window: self.reconnect_window,
        }
    }

    fn execution(&self) -> ExecutionConfig {
        ExecutionConfig {
            timeout: self.execution_timeout,
            max_output_bytes: self.max_output_bytes,
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
    pub rejected_frames: u64,
    pub lagged_receivers: u64,
    pub active_rooms: usize,
    pub rooms_evicted: u64,
}

/// The code room server.
pub struct CodeRoomServer {
    config: ServerConfig,
    store: SessionStore,
    gateway: ConnectionGateway,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
}

impl CodeRoomServer {
    /// Build a server. Fails only if the archive cannot be opened.
    pub fn new(
        config: ServerConfig,
        executor: Arc<dyn SandboxExecutor>,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Result<Self, ArchiveError> {
        let store = match &config.archive_path {
            Some(path) => {
                let archive = RoomArchive::open(ArchiveConfig::new(path.clone()))?;
                SessionStore::with_archive(config.session(), Arc::new(archive))
            }
            None => SessionStore::new(config.session()),
        };

        let presence = PresenceTracker::new(store.clone(), verifier, config.presence());
        let mut reconciler = EditReconciler::new(store.clone());
        if let Some(limit) = config.max_buffer_bytes {
            reconciler = reconciler.with_max_buffer_bytes(limit);
        }
        let dispatcher = ExecutionDispatcher::new(store.clone(), executor, config.execution());

        Ok(Self {
            gateway: ConnectionGateway::new(presence, reconciler, dispatcher),
            store,
            config,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Code room server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let gateway = self.gateway.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, gateway, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        gateway: ConnectionGateway,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let mut state = ConnectionState::new(ConnectionId::new());
        log::info!("WebSocket connection {} established from {addr}", state.id());

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        // Replies use the format of the most recent inbound frame.
        let mut format = WireFormat::Json;

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let frame = match msg {
                            Some(Ok(Message::Text(text))) => WireFrame::Text(text.as_str().to_owned()),
                            Some(Ok(Message::Binary(data))) => WireFrame::Binary(data.to_vec()),
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                                continue;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => {
                                log::debug!("Read error on {}: {e}", state.id());
                                break;
                            }
                        };
                        format = frame.format();

                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += frame.len() as u64;
                        }

                        let replies = match ClientMessage::decode(&frame) {
                            Ok(message) => gateway.handle(&mut state, message).await,
                            Err(e) => {
                                log::warn!("Undecodable frame from {}: {e}", state.id());
                                stats.write().await.rejected_frames += 1;
                                vec![malformed(e)]
                            }
                        };
                        for reply in &replies {
                            send(&mut ws_sender, reply, format).await?;
                        }
                    }
                    delivery = async {
                        match state.receiver_mut() {
                            Some(rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match delivery {
                            Ok(delivery) => {
                                if state.accepts(&delivery) {
                                    send(&mut ws_sender, &delivery.message, format).await?;
                                }
                            }
                            Err(RecvError::Lagged(n)) => {
                                log::warn!("Connection {} lagged by {n} messages, resyncing", state.id());
                                stats.write().await.lagged_receivers += 1;
                                if let Some(snapshot) = gateway.recover_lag(&mut state).await {
                                    send(&mut ws_sender, &snapshot, format).await?;
                                }
                            }
                            Err(RecvError::Closed) => {
                                // The room went away underneath us.
                                gateway.recover_lag(&mut state).await;
                            }
                        }
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        gateway.disconnect(&mut state).await;
        log::info!("WebSocket connection {} from {addr} closed", state.id());
        stats.write().await.active_connections -= 1;

        result
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        let sessions = self.store.stats().await;
        stats.active_rooms = sessions.active_rooms;
        stats.rooms_evicted = sessions.rooms_evicted;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn gateway(&self) -> &ConnectionGateway {
        &self.gateway
    }

    /// Archive every live room. Called on shutdown.
    pub async fn archive_all(&self) -> usize {
        self.store.archive_all().await
    }
}

async fn send<S>(sink: &mut S, message: &ServerMessage, format: WireFormat) -> Result<(), BoxError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let frame = match message.encode(format) {
        Ok(frame) => frame,
        Err(e) => {
            log::error!("Failed to encode {message:?}: {e}");
            return Ok(());
        }
    };
    let message = match frame {
        WireFrame::Text(text) => Message::Text(text.into()),
        WireFrame::Binary(bytes) => Message::Binary(bytes.into()),
    };
    sink.send(message).await?;
    Ok(())
}
