//! WebSocket client for one page.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, reconnect)
//! - Local edits applied at once and sent in batches
//! - Reconciliation with the relay's order through a [`Replica`]
//! - Offline editing: unsent edits are replayed after the next Welcome
//!
//! A page can only be edited once the relay has assigned this peer a
//! client id, i.e. after the first Welcome. Later disconnects keep the id,
//! so edits made offline carry valid identities.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tessera_core::{ClientId, CrdtError, Editor, Operation, Replica};
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::batch::FlushPolicy;
use crate::protocol::{MessageType, OperationBatch, PeerInfo, ProtocolError, SyncMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    Connected,
    Disconnected,
    /// Welcome received; the page was rebuilt from the relay's snapshot
    Synced { client: ClientId },
    /// Another peer's batch was applied
    RemoteOperations {
        peer_id: Uuid,
        seq: u64,
        applied: usize,
        dropped: usize,
    },
    /// One of our batches was sequenced; `rejected` ops were discarded
    Acknowledged { seq: u64, rejected: usize },
    /// A snapshot replaced the confirmed state
    Resynced { seq: u64 },
    PeerJoined(PeerInfo),
    PeerLeft(Uuid),
    /// The relay refused the Join
    Rejected(String),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long edits are coalesced before they are sent
    pub batch_interval_ms: u64,
    /// Flush as soon as this many operations are unsent
    pub max_batch: usize,
    /// Unsent operations allowed while disconnected
    pub offline_capacity: usize,
    /// Ask for a snapshot when a remote operation fails to apply
    pub resync_on_drop: bool,
    pub event_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            batch_interval_ms: 50,
            max_batch: 64,
            offline_capacity: 10_000,
            resync_on_drop: true,
            event_capacity: 256,
        }
    }
}

/// What the reader has to do after handling a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Followup {
    Nothing,
    Flush,
    RequestSnapshot,
}

struct ClientState {
    replica: Replica,
    policy: FlushPolicy,
    /// A client id has been assigned at least once
    welcomed: bool,
    /// The current connection received its Welcome
    synced: bool,
    last_seq: u64,
}

impl ClientState {
    fn new(doc_id: Uuid, config: &ClientConfig) -> Self {
        Self {
            replica: Replica::new(Editor::new(doc_id, 0)),
            policy: FlushPolicy::new(
                Duration::from_millis(config.batch_interval_ms),
                config.max_batch,
            ),
            welcomed: false,
            synced: false,
            last_seq: 0,
        }
    }

    /// Fold one relay frame into the replica.
    fn handle(
        &mut self,
        own: Uuid,
        msg: &SyncMessage,
        resync_on_drop: bool,
    ) -> Result<(Option<SyncEvent>, Followup), ProtocolError> {
        let doc_id = self.replica.editor().page_id();
        match msg.msg_type {
            MessageType::Welcome => {
                let welcome = msg.welcome_payload()?;
                let confirmed = Editor::deserialize(doc_id, welcome.snapshot)?;
                self.replica.reset(confirmed, welcome.client);
                self.welcomed = true;
                self.synced = true;
                self.last_seq = msg.seq;
                info!("Synced page {} as client {}", doc_id, welcome.client);
                Ok((
                    Some(SyncEvent::Synced {
                        client: welcome.client,
                    }),
                    Followup::Flush,
                ))
            }
            MessageType::Snapshot => {
                let confirmed = Editor::deserialize(doc_id, msg.snapshot_payload()?)?;
                let client = self.replica.client();
                self.replica.reset(confirmed, client);
                self.last_seq = msg.seq;
                Ok((Some(SyncEvent::Resynced { seq: msg.seq }), Followup::Flush))
            }
            MessageType::Operations => {
                if msg.seq <= self.last_seq {
                    debug!("Skipping seq {} already folded into seq {}", msg.seq, self.last_seq);
                    return Ok((None, Followup::Nothing));
                }
                self.last_seq = msg.seq;
                let batch = msg.operation_batch()?;

                if msg.peer_id == own {
                    let rejected = self.replica.acknowledge(batch.batch, &batch.ops);
                    if rejected > 0 {
                        warn!("Relay rejected {} op(s) of batch {}", rejected, batch.batch);
                    }
                    return Ok((
                        Some(SyncEvent::Acknowledged {
                            seq: msg.seq,
                            rejected,
                        }),
                        Followup::Nothing,
                    ));
                }

                let outcome = self.replica.receive(&batch.ops);
                let followup = if outcome.dropped > 0 && resync_on_drop {
                    Followup::RequestSnapshot
                } else {
                    Followup::Nothing
                };
                Ok((
                    Some(SyncEvent::RemoteOperations {
                        peer_id: msg.peer_id,
                        seq: msg.seq,
                        applied: outcome.applied,
                        dropped: outcome.dropped,
                    }),
                    followup,
                ))
            }
            MessageType::PeerJoined if msg.peer_id != own => {
                Ok((Some(SyncEvent::PeerJoined(msg.peer_info()?)), Followup::Nothing))
            }
            MessageType::PeerLeft if msg.peer_id != own => {
                Ok((Some(SyncEvent::PeerLeft(msg.peer_id)), Followup::Nothing))
            }
            MessageType::Rejected => Ok((Some(SyncEvent::Rejected(msg.reason()?)), Followup::Nothing)),
            _ => Ok((None, Followup::Nothing)),
        }
    }

    /// Send every unsent operation, `max_batch` per frame.
    async fn flush(
        &mut self,
        out: &mpsc::Sender<Message>,
        peer_id: Uuid,
    ) -> Result<usize, ProtocolError> {
        if !self.synced {
            return Ok(0);
        }
        let doc_id = self.replica.editor().page_id();
        let mut frames = 0;
        while let Some(batch) = self.replica.take_unsent(self.policy.max_batch()) {
            let msg = SyncMessage::operations(
                peer_id,
                doc_id,
                0,
                &OperationBatch {
                    batch: batch.id,
                    ops: batch.ops,
                },
            )?;
            out.send(Message::Binary(msg.encode()?.into()))
                .await
                .map_err(|_| ProtocolError::ConnectionClosed)?;
            frames += 1;
        }
        self.policy.reset();
        Ok(frames)
    }
}

/// The sync client.
pub struct SyncClient {
    peer_info: PeerInfo,
    doc_id: Uuid,
    server_url: String,
    config: ClientConfig,

    connection: Arc<RwLock<ConnectionState>>,
    shared: Arc<Mutex<ClientState>>,
    /// Wakes the batcher after an edit
    edited: Arc<Notify>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Message>>,
    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    writer: Option<JoinHandle<()>>,
    /// Reader and batcher of the current connection
    tasks: Vec<JoinHandle<()>>,
}

impl SyncClient {
    pub fn new(peer_info: PeerInfo, doc_id: Uuid, server_url: impl Into<String>) -> Self {
        Self::with_config(peer_info, doc_id, server_url, ClientConfig::default())
    }

    pub fn with_config(
        peer_info: PeerInfo,
        doc_id: Uuid,
        server_url: impl Into<String>,
        config: ClientConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity.max(1));
        Self {
            peer_info,
            doc_id,
            server_url: server_url.into(),
            shared: Arc::new(Mutex::new(ClientState::new(doc_id, &config))),
            config,
            connection: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            edited: Arc::new(Notify::new()),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
            writer: None,
            tasks: Vec::new(),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Connect and join the page's room.
    ///
    /// Returns once the Join is sent; the Welcome arrives as
    /// [`SyncEvent::Synced`].
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        self.stop_tasks();
        {
            let mut state = self.connection.write().await;
            if *state != ConnectionState::Reconnecting {
                *state = ConnectionState::Connecting;
            }
        }

        let url = format!("{}/{}", self.server_url, self.doc_id);
        let ws_stream = match tokio_tungstenite::connect_async(&url).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                warn!("Failed to connect to {url}: {e}");
                *self.connection.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(256);
        self.outgoing_tx = Some(out_tx.clone());

        self.writer = Some(tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        }));

        self.shared.lock().await.synced = false;
        let join = SyncMessage::join(self.doc_id, &self.peer_info)?;
        out_tx
            .send(Message::Binary(join.encode()?.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        *self.connection.write().await = ConnectionState::Connected;
        emit(&self.event_tx, SyncEvent::Connected);

        // Reader: fold relay frames into the replica.
        let shared = self.shared.clone();
        let connection = self.connection.clone();
        let event_tx = self.event_tx.clone();
        let out = out_tx.clone();
        let peer_id = self.peer_info.peer_id;
        let doc_id = self.doc_id;
        let resync_on_drop = self.config.resync_on_drop;
        self.tasks.push(tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                let bytes: Vec<u8> = match frame {
                    Ok(Message::Binary(data)) => data.into(),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let msg = match SyncMessage::decode(&bytes) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!("Undecodable frame from relay: {e}");
                        continue;
                    }
                };

                let mut state = shared.lock().await;
                let (event, followup) = match state.handle(peer_id, &msg, resync_on_drop) {
                    Ok(handled) => handled,
                    Err(e) => {
                        warn!("Failed to handle {:?}: {e}", msg.msg_type);
                        continue;
                    }
                };
                let sent = match followup {
                    Followup::Nothing => Ok(()),
                    Followup::Flush => state.flush(&out, peer_id).await.map(|_| ()),
                    Followup::RequestSnapshot => {
                        match SyncMessage::snapshot_request(peer_id, doc_id).encode() {
                            Ok(bytes) => out
                                .send(Message::Binary(bytes.into()))
                                .await
                                .map_err(|_| ProtocolError::ConnectionClosed),
                            Err(e) => Err(e),
                        }
                    }
                };
                drop(state);

                if let Err(e) = sent {
                    warn!("Failed to answer {:?}: {e}", msg.msg_type);
                }
                if let Some(event) = event {
                    emit(&event_tx, event);
                }
            }

            shared.lock().await.synced = false;
            *connection.write().await = ConnectionState::Disconnected;
            emit(&event_tx, SyncEvent::Disconnected);
        }));

        // Batcher: flush once the policy says so.
        let shared = self.shared.clone();
        let edited = self.edited.clone();
        self.tasks.push(tokio::spawn(async move {
            loop {
                let deadline = shared.lock().await.policy.deadline();
                match deadline {
                    Some(deadline) => {
                        let deadline = tokio::time::Instant::from_std(deadline);
                        tokio::select! {
                            _ = edited.notified() => {}
                            _ = tokio::time::sleep_until(deadline) => {}
                        }
                    }
                    None => edited.notified().await,
                }

                let mut state = shared.lock().await;
                let unsent = state.replica.unsent_len();
                if state.policy.is_due(Instant::now(), unsent) {
                    if let Err(e) = state.flush(&out_tx, peer_id).await {
                        debug!("Batcher stopping: {e}");
                        break;
                    }
                }
            }
        }));

        info!("Connected to {url} as {}", self.peer_info.name);
        Ok(())
    }

    /// Drop the current connection, if any, and connect again.
    pub async fn reconnect(&mut self) -> Result<(), ProtocolError> {
        *self.connection.write().await = ConnectionState::Reconnecting;
        self.connect().await
    }

    /// Run local intent against the page and queue the operations it
    /// returns. Returns how many operations were queued.
    pub async fn edit<F>(&self, f: F) -> Result<usize, ProtocolError>
    where
        F: FnOnce(&mut Editor) -> Result<Vec<Operation>, CrdtError>,
    {
        let connected = *self.connection.read().await == ConnectionState::Connected;
        let mut state = self.shared.lock().await;
        if !state.welcomed {
            return Err(ProtocolError::NotSynced);
        }
        let unsent = state.replica.unsent_len();
        if !connected && unsent >= self.config.offline_capacity {
            return Err(ProtocolError::QueueFull(unsent));
        }

        let queued = state.replica.edit(f)?;
        if queued == 0 {
            return Ok(0);
        }

        let now = Instant::now();
        state.policy.note_edit(now);
        let unsent = state.replica.unsent_len();
        if connected && unsent >= state.policy.max_batch() {
            if let Some(out) = &self.outgoing_tx {
                state.flush(out, self.peer_info.peer_id).await?;
            }
        } else {
            self.edited.notify_one();
        }
        Ok(queued)
    }

    /// [`edit`](Self::edit) for intent producing a single operation.
    pub async fn edit_one<F>(&self, f: F) -> Result<usize, ProtocolError>
    where
        F: FnOnce(&mut Editor) -> Result<Operation, CrdtError>,
    {
        self.edit(|editor| f(editor).map(|op| vec![op])).await
    }

    /// Send everything unsent right away. Returns the number of frames.
    pub async fn flush(&self) -> Result<usize, ProtocolError> {
        let Some(out) = &self.outgoing_tx else {
            return Ok(0);
        };
        self.shared
            .lock()
            .await
            .flush(out, self.peer_info.peer_id)
            .await
    }

    /// Ask the relay for a fresh snapshot.
    pub async fn request_snapshot(&self) -> Result<(), ProtocolError> {
        let msg = SyncMessage::snapshot_request(self.peer_info.peer_id, self.doc_id);
        self.send_raw(msg.encode()?).await
    }

    pub async fn send_ping(&self) -> Result<(), ProtocolError> {
        let msg = SyncMessage::ping(self.peer_info.peer_id);
        self.send_raw(msg.encode()?).await
    }

    async fn send_raw(&self, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        let out = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        out.send(Message::Binary(bytes.into()))
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Close the connection. Unsent edits are kept for the next connect.
    pub async fn disconnect(&mut self) {
        if let Some(out) = self.outgoing_tx.take() {
            let _ = out.send(Message::Close(None)).await;
        }
        self.stop_tasks();
        self.shared.lock().await.synced = false;

        let mut state = self.connection.write().await;
        if *state != ConnectionState::Disconnected {
            *state = ConnectionState::Disconnected;
            emit(&self.event_tx, SyncEvent::Disconnected);
        }
    }

    fn stop_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
        // Detached: it drains the queue and exits once every sender is gone.
        self.writer.take();
    }

    /// Copy of the page as the user sees it.
    pub async fn editor(&self) -> Editor {
        self.shared.lock().await.replica.editor().clone()
    }

    pub async fn text(&self) -> String {
        self.shared.lock().await.replica.editor().text()
    }

    /// Assigned client id; `0` before the first Welcome.
    pub async fn client(&self) -> ClientId {
        self.shared.lock().await.replica.client()
    }

    /// Local operations the relay has not acknowledged yet.
    pub async fn pending_len(&self) -> usize {
        self.shared.lock().await.replica.pending_len()
    }

    pub async fn unsent_len(&self) -> usize {
        self.shared.lock().await.replica.unsent_len()
    }

    pub async fn is_synced(&self) -> bool {
        self.shared.lock().await.synced
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.connection.read().await
    }

    pub fn peer_info(&self) -> &PeerInfo {
        &self.peer_info
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Events are advisory; a full channel drops them instead of stalling the reader.
fn emit(tx: &mpsc::Sender<SyncEvent>, event: SyncEvent) {
    if let Err(e) = tx.try_send(event) {
        debug!("Dropping sync event: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Welcome;
    use tessera_core::{BlockKind, TextStyle};

    fn welcomed_state(doc: Uuid, client: ClientId, relay: &Editor, seq: u64) -> ClientState {
        let mut state = ClientState::new(doc, &ClientConfig::default());
        let welcome = Welcome {
            client,
            snapshot: relay.serialize(),
        };
        let msg = SyncMessage::welcome(doc, seq, &welcome).unwrap();
        let (event, followup) = state.handle(Uuid::new_v4(), &msg, true).unwrap();
        assert_eq!(event, Some(SyncEvent::Synced { client }));
        assert_eq!(followup, Followup::Flush);
        state
    }

    fn remote_paragraph(doc: Uuid, client: ClientId, text: &str) -> Vec<Operation> {
        let mut editor = Editor::new(doc, client);
        let mut ops = vec![editor.insert_block(0, BlockKind::Paragraph).unwrap()];
        let block = editor.block_id(0).unwrap();
        ops.extend(editor.insert_text(block, 0, text, TextStyle::empty()).unwrap());
        ops
    }

    #[test]
    fn test_client_creation() {
        let info = PeerInfo::new("TestUser");
        let doc_id = Uuid::new_v4();
        let client = SyncClient::new(info, doc_id, "ws://localhost:9090");

        assert_eq!(client.peer_info().name, "TestUser");
        assert_eq!(client.doc_id(), doc_id);
        assert_eq!(client.server_url(), "ws://localhost:9090");
        assert_eq!(client.config().max_batch, 64);
    }

    #[tokio::test]
    async fn test_client_initial_state() {
        let client = SyncClient::new(PeerInfo::new("TestUser"), Uuid::new_v4(), "ws://localhost:9090");

        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
        assert_eq!(client.client().await, 0);
        assert_eq!(client.pending_len().await, 0);
        assert!(!client.is_synced().await);
        assert_eq!(client.flush().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_edit_before_welcome_fails() {
        let client = SyncClient::new(PeerInfo::new("TestUser"), Uuid::new_v4(), "ws://localhost:9090");
        let result = client
            .edit_one(|editor| editor.insert_block(0, BlockKind::Paragraph))
            .await;
        assert!(matches!(result, Err(ProtocolError::NotSynced)));
    }

    #[tokio::test]
    async fn test_connect_failure_resets_state() {
        let mut client = SyncClient::new(PeerInfo::new("TestUser"), Uuid::new_v4(), "ws://127.0.0.1:1");
        assert!(client.connect().await.is_err());
        assert_eq!(client.connection_state().await, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_take_event_rx() {
        let mut client = SyncClient::new(PeerInfo::new("TestUser"), Uuid::new_v4(), "ws://localhost:9090");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[test]
    fn test_welcome_rebuilds_page() {
        let doc = Uuid::new_v4();
        let mut relay = Editor::new(doc, 0);
        for op in remote_paragraph(doc, 1, "shared") {
            relay.apply(&op).unwrap();
        }

        let state = welcomed_state(doc, 2, &relay, 5);
        assert_eq!(state.replica.editor().text(), "shared");
        assert_eq!(state.replica.client(), 2);
        assert_eq!(state.last_seq, 5);
        assert!(state.synced);
    }

    #[test]
    fn test_remote_batch_and_stale_seq() {
        let doc = Uuid::new_v4();
        let me = Uuid::new_v4();
        let other = Uuid::new_v4();
        let mut state = welcomed_state(doc, 2, &Editor::new(doc, 0), 0);

        let batch = OperationBatch {
            batch: 1,
            ops: remote_paragraph(doc, 1, "hi"),
        };
        let msg = SyncMessage::operations(other, doc, 1, &batch).unwrap();
        let (event, followup) = state.handle(me, &msg, true).unwrap();
        assert_eq!(
            event,
            Some(SyncEvent::RemoteOperations {
                peer_id: other,
                seq: 1,
                applied: 3,
                dropped: 0,
            })
        );
        assert_eq!(followup, Followup::Nothing);
        assert_eq!(state.replica.editor().text(), "hi");

        // Replayed frame below the high-water mark is ignored.
        let (event, _) = state.handle(me, &msg, true).unwrap();
        assert_eq!(event, None);
    }

    #[test]
    fn test_dropped_remote_op_requests_snapshot() {
        let doc = Uuid::new_v4();
        let mut state = welcomed_state(doc, 2, &Editor::new(doc, 0), 0);

        // Char insert into a block this replica never saw.
        let orphan = remote_paragraph(doc, 1, "x").pop().unwrap();
        let batch = OperationBatch {
            batch: 3,
            ops: vec![orphan],
        };
        let msg = SyncMessage::operations(Uuid::new_v4(), doc, 1, &batch).unwrap();

        let (_, followup) = state.handle(Uuid::new_v4(), &msg, true).unwrap();
        assert_eq!(followup, Followup::RequestSnapshot);

        let msg = SyncMessage::operations(Uuid::new_v4(), doc, 2, &batch).unwrap();
        let (_, followup) = state.handle(Uuid::new_v4(), &msg, false).unwrap();
        assert_eq!(followup, Followup::Nothing);
    }

    #[test]
    fn test_own_echo_acknowledges() {
        let doc = Uuid::new_v4();
        let me = Uuid::new_v4();
        let mut state = welcomed_state(doc, 1, &Editor::new(doc, 0), 0);

        state
            .replica
            .edit(|e| Ok(vec![e.insert_block(0, BlockKind::Checkbox)?]))
            .unwrap();
        let sent = state.replica.take_unsent(8).unwrap();
        assert_eq!(state.replica.pending_len(), 1);

        let echo = SyncMessage::operations(
            me,
            doc,
            1,
            &OperationBatch {
                batch: sent.id,
                ops: sent.ops,
            },
        )
        .unwrap();
        let (event, _) = state.handle(me, &echo, true).unwrap();
        assert_eq!(event, Some(SyncEvent::Acknowledged { seq: 1, rejected: 0 }));
        assert_eq!(state.replica.pending_len(), 0);
        assert_eq!(state.replica.editor(), state.replica.confirmed());
    }

    #[test]
    fn test_own_presence_is_silent() {
        let doc = Uuid::new_v4();
        let info = PeerInfo::new("Me");
        let mut state = welcomed_state(doc, 1, &Editor::new(doc, 0), 0);

        let joined = SyncMessage::peer_joined(doc, &info).unwrap();
        assert_eq!(state.handle(info.peer_id, &joined, true).unwrap().0, None);

        let left = SyncMessage::peer_left(info.peer_id, doc);
        let (event, _) = state.handle(Uuid::new_v4(), &left, true).unwrap();
        assert_eq!(event, Some(SyncEvent::PeerLeft(info.peer_id)));
    }

    #[tokio::test]
    async fn test_flush_respects_max_batch() {
        let doc = Uuid::new_v4();
        let config = ClientConfig {
            max_batch: 2,
            ..ClientConfig::default()
        };
        let mut state = ClientState::new(doc, &config);
        state.synced = true;
        state.welcomed = true;
        state.replica.reset(Editor::new(doc, 0), 1);
        state
            .replica
            .edit(|e| {
                let mut ops = vec![e.insert_block(0, BlockKind::Paragraph)?];
                let block = e.block_id(0)?;
                ops.extend(e.insert_text(block, 0, "abcd", TextStyle::empty())?);
                Ok(ops)
            })
            .unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        assert_eq!(state.flush(&tx, Uuid::new_v4()).await.unwrap(), 3);
        assert_eq!(state.replica.unsent_len(), 0);

        let mut sizes = Vec::new();
        while let Ok(Message::Binary(bytes)) = rx.try_recv() {
            let msg = SyncMessage::decode(&bytes).unwrap();
            sizes.push(msg.operation_batch().unwrap().ops.len());
        }
        assert_eq!(sizes, vec![2, 2, 1]);
    }
}
