//! WebSocket relay with one sequencing room per page.
//!
//! ```text
//! Client A ──┐                               ┌── MemoryStore
//!             ├── Room (page) ── Editor ──────┤   or
//! Client B ──┘      │                         └── DocumentStore (RocksDB)
//!                   └── BroadcastGroup ──► A, B, C
//! ```
//!
//! A connection's first frame must be `Join`. After the `Welcome`, the
//! connection forwards `Operations` to its room and relays every frame the
//! room broadcasts. A background task persists dirty rooms and evicts
//! rooms that have been empty for `idle_timeout_secs`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tessera_core::ClientId;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::protocol::{MessageType, PeerInfo, SyncMessage};
use crate::room::{Frames, Joined, RegistryConfig, Room, RoomError, RoomRegistry};
use crate::storage::{DocumentStore, MemoryStore, SnapshotStore, StoreConfig, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

/// Attempts to join a room that keeps getting evicted under us.
const JOIN_ATTEMPTS: usize = 3;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub max_peers_per_room: usize,
    /// Frames buffered per peer before it lags and is resynced
    pub broadcast_capacity: usize,
    /// WebSocket ping interval
    pub heartbeat_interval_secs: u64,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Empty rooms are evicted after this long
    pub idle_timeout_secs: u64,
    /// How often dirty rooms are written to the store
    pub persist_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_peers_per_room: 100,
            broadcast_capacity: 256,
            heartbeat_interval_secs: 30,
            storage_path: None,
            idle_timeout_secs: 300,
            persist_interval_secs: 5,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `TESSERA_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            default: T,
        ) -> T {
            match lookup(key) {
                Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
                    warn!("Ignoring invalid {key}={raw}");
                    default
                }),
                None => default,
            }
        }

        let defaults = Self::default();
        Self {
            bind_addr: lookup("TESSERA_BIND").unwrap_or(defaults.bind_addr),
            max_peers_per_room: parsed(&lookup, "TESSERA_MAX_PEERS", defaults.max_peers_per_room),
            broadcast_capacity: parsed(
                &lookup,
                "TESSERA_BROADCAST_CAPACITY",
                defaults.broadcast_capacity,
            ),
            heartbeat_interval_secs: parsed(
                &lookup,
                "TESSERA_HEARTBEAT",
                defaults.heartbeat_interval_secs,
            ),
            storage_path: lookup("TESSERA_STORAGE")
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            idle_timeout_secs: parsed(&lookup, "TESSERA_IDLE_TIMEOUT", defaults.idle_timeout_secs),
            persist_interval_secs: parsed(
                &lookup,
                "TESSERA_PERSIST_INTERVAL",
                defaults.persist_interval_secs,
            ),
        }
    }

    fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            broadcast_capacity: self.broadcast_capacity,
            max_peers: self.max_peers_per_room,
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
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
    pub active_rooms: usize,
    pub rejected_joins: u64,
    pub persisted_snapshots: u64,
    pub evicted_rooms: u64,
    /// Snapshots sent to recover lagging or diverged peers
    pub resyncs: u64,
}

/// Membership of one connection once its Join succeeded.
struct Session {
    peer_id: Uuid,
    client: ClientId,
    room: Arc<Room>,
    frames: Frames,
}

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Open the configured store (RocksDB if `storage_path` is set).
    pub fn new(config: ServerConfig) -> Result<Self, StoreError> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => Arc::new(DocumentStore::open(StoreConfig::new(path))?),
            None => Arc::new(MemoryStore::new()),
        };
        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: ServerConfig, store: Arc<dyn SnapshotStore>) -> Self {
        let registry = Arc::new(RoomRegistry::new(store, config.registry_config()));
        Self {
            config,
            registry,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Default configuration, in-memory store.
    pub fn with_defaults() -> Self {
        Self::with_store(ServerConfig::default(), Arc::new(MemoryStore::new()))
    }

    /// Bind and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error>> {
        let maintenance = tokio::spawn(Self::maintain(
            self.registry.clone(),
            self.stats.clone(),
            Duration::from_secs(self.config.persist_interval_secs.max(1)),
        ));

        let result: Result<(), Box<dyn std::error::Error>> = loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => break Err(e.into()),
            };
            debug!("New TCP connection from {addr}");

            let registry = self.registry.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, registry, stats, config).await {
                    error!("Connection error from {addr}: {e}");
                }
            });
        };

        maintenance.abort();
        result
    }

    /// Periodically persist dirty rooms and evict idle ones.
    async fn maintain(
        registry: Arc<RoomRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        period: Duration,
    ) {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let persisted = registry.persist_dirty().await;
            let evicted = registry.evict_idle(Instant::now()).await;
            let rooms = registry.room_count().await;

            let mut s = stats.write().await;
            s.persisted_snapshots += persisted as u64;
            s.evicted_rooms += evicted.len() as u64;
            s.active_rooms = rooms;
        }
    }

    async fn join_room(
        registry: &RoomRegistry,
        doc_id: Uuid,
        info: PeerInfo,
    ) -> Result<(Arc<Room>, Joined), RoomError> {
        let mut attempt = 0;
        loop {
            let room = registry.get_or_load(doc_id).await?;
            match room.join(info.clone()).await {
                Ok(joined) => return Ok((room, joined)),
                Err(RoomError::Closed) if attempt + 1 < JOIN_ATTEMPTS => attempt += 1,
                Err(e) => return Err(e),
            }
        }
    }

    async fn send(sink: &mut WsSink, msg: &SyncMessage) -> Result<(), BoxError> {
        sink.send(Message::Binary(msg.encode()?.into())).await?;
        Ok(())
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        registry: Arc<RoomRegistry>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session: Option<Session> = None;
        let outcome = Self::connection_loop(
            &mut ws_sender,
            &mut ws_receiver,
            addr,
            &registry,
            &stats,
            &config,
            &mut session,
        )
        .await;

        if let Some(s) = session {
            s.room.leave(s.peer_id, s.client).await;
        }
        {
            let rooms = registry.room_count().await;
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = rooms;
        }

        outcome
    }

    async fn connection_loop(
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsStream,
        addr: SocketAddr,
        registry: &RoomRegistry,
        stats: &RwLock<ServerStats>,
        config: &ServerConfig,
        session: &mut Option<Session>,
    ) -> Result<(), BoxError> {
        let period = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    let bytes: Vec<u8> = match msg {
                        Some(Ok(Message::Binary(data))) => data.into(),
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            info!("Connection closed from {addr}");
                            return Ok(());
                        }
                        Some(Err(e)) => {
                            warn!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }
                        Some(Ok(_)) => continue,
                    };

                    let sync_msg = match SyncMessage::decode(&bytes) {
                        Ok(m) => m,
                        Err(e) => {
                            warn!("Failed to decode message from {addr}: {e}");
                            continue;
                        }
                    };
                    {
                        let mut s = stats.write().await;
                        s.total_messages += 1;
                        s.total_bytes += bytes.len() as u64;
                    }

                    match sync_msg.msg_type {
                        MessageType::Join if session.is_some() => {
                            warn!("Ignoring second Join from {addr}");
                        }
                        MessageType::Join => {
                            let info = sync_msg.peer_info().unwrap_or_else(|_| {
                                PeerInfo::with_id(sync_msg.peer_id, "Anonymous")
                            });
                            let peer_id = info.peer_id;
                            match Self::join_room(registry, sync_msg.doc_id, info).await {
                                Ok((room, joined)) => {
                                    let welcome =
                                        SyncMessage::welcome(sync_msg.doc_id, joined.seq, &joined.welcome)?;
                                    Self::send(ws_sender, &welcome).await?;
                                    let rooms = registry.room_count().await;
                                    stats.write().await.active_rooms = rooms;
                                    *session = Some(Session {
                                        peer_id,
                                        client: joined.client,
                                        room,
                                        frames: joined.receiver,
                                    });
                                }
                                Err(e) => {
                                    warn!("Rejecting {addr} from page {}: {e}", sync_msg.doc_id);
                                    stats.write().await.rejected_joins += 1;
                                    let rejected = SyncMessage::rejected(sync_msg.doc_id, &e.to_string());
                                    Self::send(ws_sender, &rejected).await?;
                                    ws_sender.send(Message::Close(None)).await?;
                                    return Ok(());
                                }
                            }
                        }
                        MessageType::Ping => {
                            Self::send(ws_sender, &SyncMessage::pong(sync_msg.peer_id)).await?;
                        }
                        other => {
                            let Some(s) = session.as_mut() else {
                                warn!("{:?} from {addr} before Join", other);
                                continue;
                            };
                            match other {
                                MessageType::Operations => match sync_msg.operation_batch() {
                                    Ok(batch) => {
                                        if let Err(e) = s.room.submit(s.peer_id, batch).await {
                                            error!("Failed to sequence batch from {addr}: {e}");
                                        }
                                    }
                                    Err(e) => warn!("Bad operation batch from {addr}: {e}"),
                                },
                                MessageType::SnapshotRequest => {
                                    Self::resync(ws_sender, s).await?;
                                    stats.write().await.resyncs += 1;
                                }
                                _ => debug!("Unhandled message type: {:?}", other),
                            }
                        }
                    }
                }

                frame = async {
                    match session.as_mut() {
                        Some(s) => s.frames.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    let Some(s) = session.as_mut() else { continue };
                    match frame {
                        Ok(data) => {
                            // Own frames are only forwarded as batch acks.
                            if let Ok(header) = SyncMessage::decode(&data) {
                                if header.peer_id == s.peer_id
                                    && header.msg_type != MessageType::Operations
                                {
                                    continue;
                                }
                            }
                            ws_sender.send(Message::Binary(data.to_vec().into())).await?;
                        }
                        Err(RecvError::Lagged(n)) => {
                            warn!("Peer {} lagged by {n} frames, resyncing", s.peer_id);
                            s.room.broadcast().record_lag(n);
                            Self::resync(ws_sender, s).await?;
                            stats.write().await.resyncs += 1;
                        }
                        Err(RecvError::Closed) => return Ok(()),
                    }
                }

                _ = heartbeat.tick() => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }
    }

    /// Send a fresh snapshot and restart the peer's frame stream after it.
    async fn resync(ws_sender: &mut WsSink, session: &mut Session) -> Result<(), BoxError> {
        let (seq, snapshot, frames) = session.room.resync().await;
        session.frames = frames;
        let msg = SyncMessage::snapshot(session.room.doc_id(), seq, &snapshot)?;
        Self::send(ws_sender, &msg).await
    }

    /// Write every dirty room now, e.g. before shutdown.
    pub async fn persist_all(&self) -> usize {
        let persisted = self.registry.persist_dirty().await;
        self.stats.write().await.persisted_snapshots += persisted as u64;
        persisted
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }
}
