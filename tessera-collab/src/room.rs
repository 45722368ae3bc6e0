//! Page rooms: the relay's sequencer.
//!
//! Every room owns the authoritative replica of one page. Submitted
//! batches are applied and rebroadcast while the room's mutex is held, so
//! all peers observe one total order of operations per page.
//!
//! ```text
//! peer A ──submit──┐                       ┌──► peer A (ack)
//!                  ├─► Room (Mutex) ─seq─► ├──► peer B
//! peer B ──submit──┘    Editor (client 0)  └──► peer C
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info};
use tessera_core::{Block, ClientId, CrdtError, CrdtSnapshot, Editor};
use tokio::sync::{broadcast, Mutex, RwLock};
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::protocol::{OperationBatch, PeerInfo, ProtocolError, SyncMessage, Welcome};
use crate::storage::{decode_page, encode_page, SnapshotStore, StoreError, StoredPage};

/// Replica number of the relay's own editor. Peers are numbered from 1.
pub const RELAY_CLIENT: ClientId = 0;

pub type Frames = broadcast::Receiver<Arc<Vec<u8>>>;

#[derive(Debug)]
pub enum RoomError {
    /// Room already holds this many peers
    Full(usize),
    /// Room was evicted; look it up again
    Closed,
    Protocol(ProtocolError),
    Store(StoreError),
    /// Stored snapshot could not be restored
    Snapshot(CrdtError),
}

impl std::fmt::Display for RoomError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoomError::Full(max) => write!(f, "Room is full ({max} peers)"),
            RoomError::Closed => write!(f, "Room is closed"),
            RoomError::Protocol(e) => write!(f, "Protocol error: {e}"),
            RoomError::Store(e) => write!(f, "Store error: {e}"),
            RoomError::Snapshot(e) => write!(f, "Snapshot error: {e}"),
        }
    }
}

impl std::error::Error for RoomError {}

impl From<ProtocolError> for RoomError {
    fn from(e: ProtocolError) -> Self {
        RoomError::Protocol(e)
    }
}

impl From<StoreError> for RoomError {
    fn from(e: StoreError) -> Self {
        RoomError::Store(e)
    }
}

impl From<CrdtError> for RoomError {
    fn from(e: CrdtError) -> Self {
        RoomError::Snapshot(e)
    }
}

/// A peer admitted into a room.
pub struct Joined {
    pub client: ClientId,
    pub seq: u64,
    pub welcome: Welcome,
    /// Subscribed in the same critical section the snapshot was taken in
    pub receiver: Frames,
}

/// Outcome of sequencing one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitted {
    pub seq: u64,
    pub accepted: usize,
    pub rejected: usize,
}

struct RoomState {
    editor: Editor,
    next_client: ClientId,
    seq: u64,
    dirty: bool,
    last_active: Instant,
    closed: bool,
}

pub struct Room {
    doc_id: Uuid,
    state: Mutex<RoomState>,
    broadcast: Arc<BroadcastGroup>,
    max_peers: usize,
}

impl Room {
    pub fn new(editor: Editor, broadcast_capacity: usize, max_peers: usize) -> Self {
        Self::with_next_client(editor, RELAY_CLIENT + 1, broadcast_capacity, max_peers)
    }

    /// Room that resumes client numbering at `next_client`, or past every
    /// client the page's identities mention if that is higher.
    pub fn with_next_client(
        editor: Editor,
        next_client: ClientId,
        broadcast_capacity: usize,
        max_peers: usize,
    ) -> Self {
        let next_client = next_client
            .max(editor.max_client() + 1)
            .max(RELAY_CLIENT + 1);
        Self {
            doc_id: editor.page_id(),
            state: Mutex::new(RoomState {
                editor,
                next_client,
                seq: 0,
                dirty: false,
                last_active: Instant::now(),
                closed: false,
            }),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
            max_peers,
        }
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn broadcast(&self) -> &Arc<BroadcastGroup> {
        &self.broadcast
    }

    /// Admit a peer: assign a fresh client id, snapshot the page and
    /// subscribe to the room, then announce the peer to the others.
    pub async fn join(&self, info: PeerInfo) -> Result<Joined, RoomError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(RoomError::Closed);
        }
        if self.broadcast.peer_count().await >= self.max_peers {
            return Err(RoomError::Full(self.max_peers));
        }

        let client = state.next_client;
        state.next_client += 1;
        state.last_active = Instant::now();
        // The issued id must reach the store even if the peer never edits.
        state.dirty = true;

        let announce = SyncMessage::peer_joined(self.doc_id, &info)?;
        let name = info.name.clone();
        let receiver = self.broadcast.add_peer(info, client).await;
        self.broadcast.broadcast(&announce)?;

        info!(
            "Peer '{}' joined page {} as client {}",
            name, self.doc_id, client
        );
        Ok(Joined {
            client,
            seq: state.seq,
            welcome: Welcome {
                client,
                snapshot: state.editor.serialize(),
            },
            receiver,
        })
    }

    /// Apply a peer's batch in relay order and rebroadcast what was
    /// accepted. The rebroadcast also reaches the sender as its ack, even
    /// when every operation was rejected.
    pub async fn submit(&self, peer_id: Uuid, batch: OperationBatch) -> Result<Submitted, RoomError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(RoomError::Closed);
        }

        let total = batch.ops.len();
        let accepted: Vec<_> = batch
            .ops
            .into_iter()
            .filter(|op| state.editor.apply_logged(op))
            .collect();

        state.seq += 1;
        state.last_active = Instant::now();
        if !accepted.is_empty() {
            state.dirty = true;
        }

        let submitted = Submitted {
            seq: state.seq,
            accepted: accepted.len(),
            rejected: total - accepted.len(),
        };
        let relayed = OperationBatch {
            batch: batch.batch,
            ops: accepted,
        };
        let msg = SyncMessage::operations(peer_id, self.doc_id, state.seq, &relayed)?;
        self.broadcast.broadcast(&msg)?;

        debug!(
            "Sequenced batch {} from {} on page {} as seq {} ({} accepted, {} rejected)",
            batch.batch, peer_id, self.doc_id, submitted.seq, submitted.accepted, submitted.rejected
        );
        Ok(submitted)
    }

    /// Fresh snapshot plus a receiver positioned right after it.
    pub async fn resync(&self) -> (u64, CrdtSnapshot<Block>, Frames) {
        let state = self.state.lock().await;
        (state.seq, state.editor.serialize(), self.broadcast.subscribe())
    }

    /// Remove a peer. A stale connection whose peer id has since rejoined
    /// under a new client id leaves the newer entry alone.
    pub async fn leave(&self, peer_id: Uuid, client: ClientId) -> bool {
        let mut state = self.state.lock().await;
        if self.broadcast.client_of(&peer_id).await != Some(client) {
            return false;
        }
        self.broadcast.remove_peer(&peer_id).await;
        state.last_active = Instant::now();

        if let Err(e) = self.broadcast.broadcast(&SyncMessage::peer_left(peer_id, self.doc_id)) {
            error!("Failed to announce departure of {}: {}", peer_id, e);
        }
        info!("Peer {} (client {}) left page {}", peer_id, client, self.doc_id);
        true
    }

    pub async fn snapshot(&self) -> CrdtSnapshot<Block> {
        self.state.lock().await.editor.serialize()
    }

    pub async fn text(&self) -> String {
        self.state.lock().await.editor.text()
    }

    pub async fn seq(&self) -> u64 {
        self.state.lock().await.seq
    }

    pub async fn peer_count(&self) -> usize {
        self.broadcast.peer_count().await
    }

    /// Page to persist, if anything changed since the last one.
    pub async fn take_dirty_page(&self) -> Option<StoredPage> {
        let mut state = self.state.lock().await;
        if !state.dirty {
            return None;
        }
        state.dirty = false;
        Some(StoredPage {
            next_client: state.next_client,
            snapshot: state.editor.serialize(),
        })
    }

    /// Flag the room for another persistence attempt.
    pub async fn mark_dirty(&self) {
        self.state.lock().await.dirty = true;
    }

    /// Close the room if it has no peers and saw no activity for `timeout`.
    /// A closed room refuses joins and submits.
    pub async fn close_if_idle(&self, now: Instant, timeout: Duration) -> bool {
        let mut state = self.state.lock().await;
        if state.closed {
            return true;
        }
        let idle = now.saturating_duration_since(state.last_active) >= timeout;
        if idle && self.broadcast.peer_count().await == 0 {
            state.closed = true;
        }
        state.closed
    }

    async fn reopen(&self) {
        let mut state = self.state.lock().await;
        state.closed = false;
        state.dirty = true;
    }
}

/// Limits applied to every room the registry creates.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub broadcast_capacity: usize,
    pub max_peers: usize,
    pub idle_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            max_peers: 100,
            idle_timeout: Duration::from_secs(300),
        }
    }
}

/// Maps page ids to live rooms, loading them from the snapshot store on
/// first use and writing them back when dirty or evicted.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    store: Arc<dyn SnapshotStore>,
    config: RegistryConfig,
}

impl RoomRegistry {
    pub fn new(store: Arc<dyn SnapshotStore>, config: RegistryConfig) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            store,
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn SnapshotStore> {
        &self.store
    }

    /// Get the live room for a page, restoring it from the store if needed.
    pub async fn get_or_load(&self, doc_id: Uuid) -> Result<Arc<Room>, RoomError> {
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&doc_id) {
                return Ok(room.clone());
            }
        }

        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&doc_id) {
            return Ok(room.clone());
        }

        let (editor, next_client) = match self.store.get(doc_id)? {
            Some(bytes) => {
                let stored = decode_page(&bytes)?;
                let mut editor = Editor::deserialize(doc_id, stored.snapshot)?;
                editor.set_client(RELAY_CLIENT);
                info!(
                    "Loaded page {} ({} blocks, next client {})",
                    doc_id,
                    editor.len(),
                    stored.next_client
                );
                (editor, stored.next_client)
            }
            None => {
                info!("Created page {}", doc_id);
                (Editor::new(doc_id, RELAY_CLIENT), RELAY_CLIENT + 1)
            }
        };

        let room = Arc::new(Room::with_next_client(
            editor,
            next_client,
            self.config.broadcast_capacity,
            self.config.max_peers,
        ));
        rooms.insert(doc_id, room.clone());
        Ok(room)
    }

    pub async fn room(&self, doc_id: &Uuid) -> Option<Arc<Room>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    /// Write a room's snapshot if it is dirty. Returns whether it wrote.
    async fn persist_room(&self, room: &Room) -> Result<bool, RoomError> {
        let Some(page) = room.take_dirty_page().await else {
            return Ok(false);
        };
        let written = encode_page(&page).and_then(|bytes| self.store.put(room.doc_id(), &bytes));
        match written {
            Ok(()) => Ok(true),
            Err(e) => {
                room.mark_dirty().await;
                Err(e.into())
            }
        }
    }

    pub async fn persist(&self, doc_id: &Uuid) -> Result<bool, RoomError> {
        match self.room(doc_id).await {
            Some(room) => self.persist_room(&room).await,
            None => Ok(false),
        }
    }

    /// Persist every dirty room. Failures are logged and retried next time.
    pub async fn persist_dirty(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.read().await.values().cloned().collect();
        let mut written = 0;
        for room in rooms {
            match self.persist_room(&room).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => error!("Failed to persist page {}: {}", room.doc_id(), e),
            }
        }
        if written > 0 {
            debug!("Persisted {} page(s)", written);
        }
        written
    }

    /// Persist and drop rooms with no peers that have been idle for the
    /// configured timeout. Returns the evicted page ids.
    pub async fn evict_idle(&self, now: Instant) -> Vec<Uuid> {
        // Held across persistence so a concurrent load cannot read a stale snapshot.
        let mut rooms = self.rooms.write().await;
        let mut evicted = Vec::new();

        for (doc_id, room) in rooms.iter() {
            if !room.close_if_idle(now, self.config.idle_timeout).await {
                continue;
            }
            match self.persist_room(room).await {
                Ok(_) => evicted.push(*doc_id),
                Err(e) => {
                    error!("Keeping page {} in memory, persist failed: {}", doc_id, e);
                    room.reopen().await;
                }
            }
        }

        for doc_id in &evicted {
            rooms.remove(doc_id);
            info!("Evicted idle page {}", doc_id);
        }
        evicted
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_documents(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().copied().collect()
    }
}
