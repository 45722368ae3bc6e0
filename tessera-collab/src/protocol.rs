//! Binary protocol between editors and the relay.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id   │ seq      │ payload  │
//! │ 1 byte   │ 16 bytes  │ 16 bytes │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┴──────────┘
//! ```
//!
//! `seq` is stamped by the relay on every batch it sequences and on the
//! snapshots it hands out; it is zero on client-originated messages. The
//! payload is itself bincode, shaped by `msg_type`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tessera_core::{Block, ClientId, CrdtError, CrdtSnapshot, Operation};
use uuid::Uuid;

/// Discriminant of a [`SyncMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// First message on a connection: peer asks to enter a page's room
    Join = 1,
    /// Relay answer to Join: assigned client id + page snapshot
    Welcome = 2,
    /// A batch of operations; from the relay it is sequenced
    Operations = 3,
    /// Peer asks for a fresh snapshot to recover from dropped ops
    SnapshotRequest = 4,
    /// Full page snapshot
    Snapshot = 5,
    /// Payload is the new peer's [`PeerInfo`]
    PeerJoined = 6,
    PeerLeft = 7,
    /// Application-level liveness check, answered with Pong
    Ping = 8,
    Pong = 9,
    /// Join refused; payload is the reason
    Rejected = 10,
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
    /// RGBA color for caret rendering
    pub color: [f32; 4],
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    /// Reuse a known peer id, e.g. across reconnects.
    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        // Caret colour derived from the id so every peer agrees on it.
        let hash = peer_id.as_u128();
        let channel = |shift: u32| ((hash >> shift) & 0xFF) as f32 / 255.0;
        Self {
            peer_id,
            name: name.into(),
            color: [channel(0), channel(8), channel(16), 1.0],
        }
    }
}

/// Relay answer to a Join.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Welcome {
    /// Replica number the peer must mint identities with
    pub client: ClientId,
    pub snapshot: CrdtSnapshot<Block>,
}

/// Payload of an Operations message.
///
/// `batch` is chosen by the sending peer; the relay echoes it back to the
/// sender with only the operations it accepted, which doubles as the
/// acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationBatch {
    pub batch: u64,
    pub ops: Vec<Operation>,
}

/// One WebSocket binary frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    pub peer_id: Uuid,
    pub doc_id: Uuid,
    /// Relay sequence number; see the module docs
    pub seq: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn with_payload<T: Serialize>(
        msg_type: MessageType,
        peer_id: Uuid,
        doc_id: Uuid,
        seq: u64,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(payload, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))?;
        Ok(Self {
            msg_type,
            peer_id,
            doc_id,
            seq,
            payload,
        })
    }

    fn empty(msg_type: MessageType, peer_id: Uuid, doc_id: Uuid) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id,
            seq: 0,
            payload: Vec::new(),
        }
    }

    /// Ask to join the room of `doc_id`.
    pub fn join(doc_id: Uuid, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Join, info.peer_id, doc_id, 0, info)
    }

    /// `seq` is the last sequence number folded into the snapshot.
    pub fn welcome(doc_id: Uuid, seq: u64, welcome: &Welcome) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Welcome, Uuid::nil(), doc_id, seq, welcome)
    }

    /// A batch of operations. Peers send `seq == 0`; the relay stamps its own.
    pub fn operations(
        peer_id: Uuid,
        doc_id: Uuid,
        seq: u64,
        batch: &OperationBatch,
    ) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Operations, peer_id, doc_id, seq, batch)
    }

    pub fn snapshot_request(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::empty(MessageType::SnapshotRequest, peer_id, doc_id)
    }

    pub fn snapshot(
        doc_id: Uuid,
        seq: u64,
        snapshot: &CrdtSnapshot<Block>,
    ) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::Snapshot, Uuid::nil(), doc_id, seq, snapshot)
    }

    pub fn peer_joined(doc_id: Uuid, info: &PeerInfo) -> Result<Self, ProtocolError> {
        Self::with_payload(MessageType::PeerJoined, info.peer_id, doc_id, 0, info)
    }

    pub fn peer_left(peer_id: Uuid, doc_id: Uuid) -> Self {
        Self::empty(MessageType::PeerLeft, peer_id, doc_id)
    }

    pub fn rejected(doc_id: Uuid, reason: &str) -> Self {
        Self {
            payload: reason.as_bytes().to_vec(),
            ..Self::empty(MessageType::Rejected, Uuid::nil(), doc_id)
        }
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::empty(MessageType::Ping, peer_id, Uuid::nil())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::empty(MessageType::Pong, peer_id, Uuid::nil())
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Decode one frame. Unknown message types fail here.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }

    fn parse<T: DeserializeOwned>(&self, expected: &[MessageType]) -> Result<T, ProtocolError> {
        if !expected.contains(&self.msg_type) {
            return Err(ProtocolError::InvalidMessageType);
        }
        let (value, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(value)
    }

    /// Parse peer info payload (Join or PeerJoined).
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        self.parse(&[MessageType::Join, MessageType::PeerJoined])
    }

    pub fn welcome_payload(&self) -> Result<Welcome, ProtocolError> {
        self.parse(&[MessageType::Welcome])
    }

    pub fn operation_batch(&self) -> Result<OperationBatch, ProtocolError> {
        self.parse(&[MessageType::Operations])
    }

    pub fn snapshot_payload(&self) -> Result<CrdtSnapshot<Block>, ProtocolError> {
        self.parse(&[MessageType::Snapshot])
    }

    pub fn reason(&self) -> Result<String, ProtocolError> {
        if self.msg_type != MessageType::Rejected {
            return Err(ProtocolError::InvalidMessageType);
        }
        String::from_utf8(self.payload.clone())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Errors from encoding, transport or local editing.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    InvalidMessageType,
    ConnectionClosed,
    Timeout,
    /// No Welcome received yet, so there is no client id to edit with
    NotSynced,
    /// Too many unsent edits while offline
    QueueFull(usize),
    /// Local edit failed
    Edit(CrdtError),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "Serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            Self::InvalidMessageType => write!(f, "Invalid message type"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
            Self::NotSynced => write!(f, "Not synced with the relay yet"),
            Self::QueueFull(n) => write!(f, "Offline queue full ({n} operations)"),
            Self::Edit(e) => write!(f, "Edit failed: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<CrdtError> for ProtocolError {
    fn from(e: CrdtError) -> Self {
        ProtocolError::Edit(e)
    }
}
