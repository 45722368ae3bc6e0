//! Snapshot persistence for page rooms.
//!
//! ```text
//! ┌──────────────┐  put / get   ┌───────────────────────────────┐
//! │ RoomRegistry │ ───────────► │ dyn SnapshotStore             │
//! │ (in-memory)  │              │  MemoryStore | DocumentStore  │
//! └──────────────┘              └───────────────────────────────┘
//! ```
//!
//! Rooms persist lazily: a dirty room is written by the maintenance task
//! and once more when it is evicted. A stored value is the JSON form of a
//! [`StoredPage`]: the page's `CrdtSnapshot<Block>` plus the next client id
//! the room would hand out.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentStore, PageRecord, StoreConfig};

use serde::{Deserialize, Serialize};
use tessera_core::{Block, ClientId, CrdtSnapshot};
use uuid::Uuid;

/// Key-value store of page snapshots, keyed by page id.
///
/// Calls are synchronous; the registry invokes them outside any room lock
/// it does not need.
pub trait SnapshotStore: Send + Sync {
    fn get(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<(), StoreError>;

    /// Removing an absent page is not an error.
    fn delete(&self, doc_id: Uuid) -> Result<(), StoreError>;

    fn list(&self) -> Result<Vec<Uuid>, StoreError>;
}

/// Persisted form of a room.
///
/// `next_client` survives eviction so a peer that joined, edited nothing
/// and left never has its client id handed to someone else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredPage {
    pub next_client: ClientId,
    pub snapshot: CrdtSnapshot<Block>,
}

impl StoredPage {
    /// Page with no issued ids beyond those its snapshot already mentions.
    pub fn new(snapshot: CrdtSnapshot<Block>) -> Self {
        Self {
            next_client: 1,
            snapshot,
        }
    }
}

pub fn encode_page(page: &StoredPage) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(page).map_err(|e| StoreError::SerializationError(e.to_string()))
}

pub fn decode_page(bytes: &[u8]) -> Result<StoredPage, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::DeserializationError(e.to_string()))
}

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    NotFound(Uuid),
    SerializationError(String),
    DeserializationError(String),
    CompressionError(String),
    IoError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::NotFound(id) => write!(f, "Document not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "Compression error: {e}"),
            StoreError::IoError(e) => write!(f, "I/O error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::DatabaseError(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::IoError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{BlockKind, Editor, TextStyle};

    #[test]
    fn test_snapshot_codec() {
        let page = Uuid::new_v4();
        let mut editor = Editor::new(page, 1);
        editor.insert_block(0, BlockKind::Quote).unwrap();
        let block = editor.block_id(0).unwrap();
        editor
            .insert_text(block, 0, "to be", TextStyle::ITALIC)
            .unwrap();

        let stored = StoredPage {
            next_client: 4,
            snapshot: editor.serialize(),
        };
        let bytes = encode_page(&stored).unwrap();
        let json = String::from_utf8(bytes.clone()).unwrap();
        assert!(json.contains("nodeMap"));
        assert!(json.contains("\"nextClient\":4"));

        let decoded = decode_page(&bytes).unwrap();
        assert_eq!(decoded.next_client, 4);
        let restored = Editor::deserialize(page, decoded.snapshot).unwrap();
        assert_eq!(restored.text(), "to be");
    }

    #[test]
    fn test_bare_snapshot_is_not_a_page() {
        let editor = Editor::new(Uuid::new_v4(), 1);
        let bare = serde_json::to_vec(&editor.serialize()).unwrap();
        assert!(matches!(
            decode_page(&bare),
            Err(StoreError::DeserializationError(_))
        ));
    }

    #[test]
    fn test_decode_garbage() {
        let err = decode_page(b"not json").unwrap_err();
        assert!(matches!(err, StoreError::DeserializationError(_)));
    }

    #[test]
    fn test_store_error_display() {
        let id = Uuid::nil();
        assert!(StoreError::NotFound(id).to_string().contains("not found"));
        assert!(StoreError::IoError("disk".into()).to_string().contains("disk"));
    }
}
