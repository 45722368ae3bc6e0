use std::collections::HashMap;
use std::sync::RwLock;

use uuid::Uuid;

use super::{SnapshotStore, StoreError};

/// Process-local store. Snapshots are lost when the relay exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    snapshots: RwLock<HashMap<Uuid, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.snapshots.read().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned<T>(_: T) -> StoreError {
    StoreError::DatabaseError("memory store lock poisoned".into())
}

impl SnapshotStore for MemoryStore {
    fn get(&self, doc_id: Uuid) -> Result<Option<Vec<u8>>, StoreError> {
        let snapshots = self.snapshots.read().map_err(poisoned)?;
        Ok(snapshots.get(&doc_id).cloned())
    }

    fn put(&self, doc_id: Uuid, snapshot: &[u8]) -> Result<(), StoreError> {
        let mut snapshots = self.snapshots.write().map_err(poisoned)?;
        snapshots.insert(doc_id, snapshot.to_vec());
        Ok(())
    }

    fn delete(&self, doc_id: Uuid) -> Result<(), StoreError> {
        self.snapshots.write().map_err(poisoned)?.remove(&doc_id);
        Ok(())
    }

    fn list(&self) -> Result<Vec<Uuid>, StoreError> {
        Ok(self.snapshots.read().map_err(poisoned)?.keys().copied().collect())
    }
}
