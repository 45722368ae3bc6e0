//! Fan-out of relay frames to every peer in a page room.
//!
//! Frames are encoded once and shared as `Arc<Vec<u8>>`. Each peer gets an independent receiver that buffers up to `capacity`
//! frames; a peer that falls further behind sees `Lagged` and must resync
//! from a snapshot.
//!
//! Frames go to every subscriber, sender included: the relay echoes a
//! peer's own batch back to it as the acknowledgement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tessera_core::ClientId;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Snapshot of a room's fan-out counters.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    /// Frames skipped by lagging receivers
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Lock-free counters; read through [`BroadcastGroup::stats`].
#[derive(Default)]
struct Counters {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A connected peer and the replica number the relay assigned it.
#[derive(Debug, Clone, PartialEq)]
pub struct Participant {
    pub info: PeerInfo,
    pub client: ClientId,
}

/// The broadcast channel and roster of a single page room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Arc<Vec<u8>>>,
    peers: Arc<RwLock<HashMap<Uuid, Participant>>>,
    capacity: usize,
    counters: Arc<Counters>,
}

impl BroadcastGroup {
    /// `capacity` is the number of frames buffered per receiver before a
    /// slow peer starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Register a peer and hand back its receiver.
    pub async fn add_peer(
        &self,
        info: PeerInfo,
        client: ClientId,
    ) -> broadcast::Receiver<Arc<Vec<u8>>> {
        let mut peers = self.peers.write().await;
        peers.insert(info.peer_id, Participant { info, client });
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<Participant> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode once and send to every subscriber.
    ///
    /// Returns the number of receivers; zero when the room is empty.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let encoded = msg.encode()?;
        Ok(self.broadcast_raw(Arc::new(encoded)))
    }

    /// Broadcast pre-encoded bytes directly.
    pub fn broadcast_raw(&self, encoded: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(encoded).unwrap_or(0);
        self.counters
            .messages_sent
            .fetch_add(1, Ordering::Relaxed);
        count
    }

    /// A receiver reported it skipped `missed` frames.
    pub fn record_lag(&self, missed: u64) {
        self.counters
            .messages_dropped
            .fetch_add(missed, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers
            .read()
            .await
            .values()
            .map(|p| p.info.clone())
            .collect()
    }

    pub async fn has_peer(&self, peer_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(peer_id)
    }

    /// Replica number assigned to a connected peer.
    pub async fn client_of(&self, peer_id: &Uuid) -> Option<ClientId> {
        self.peers.read().await.get(peer_id).map(|p| p.client)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            messages_sent: self.counters.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.counters.messages_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Raw receiver, not tied to a roster entry.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Vec<u8>>> {
        self.sender.subscribe()
    }
}
