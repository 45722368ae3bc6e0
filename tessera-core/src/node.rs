use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::identity::{ClientId, Identity};

/// Capability every list element kind provides.
///
/// Implemented by [`Char`](crate::Char) and [`Block`](crate::Block); the
/// list and CRDT are generic over it so both specialisations are chosen at
/// compile time.
pub trait Element: Clone + fmt::Debug + Serialize + DeserializeOwned {
    /// Short name used in log lines.
    const KIND: &'static str;

    /// Rebind any nested replica to the receiving replica's client id.
    fn adopt(&mut self, _client: ClientId) {}

    /// Overwrite this value with a remote update (last writer wins).
    fn replace_with(&mut self, incoming: Self) {
        *self = incoming;
    }

    /// Pull attribute values back into range. Runs on every value a
    /// replica inserts or updates, local or remote, so author and peers
    /// store the same thing.
    fn normalize(&mut self) {}
}

/// A replicated element. `next` and `prev` are lookup keys into the owning
/// list, never ownership edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node<T> {
    pub id: Identity,
    pub value: T,
    pub next: Option<Identity>,
    pub prev: Option<Identity>,
}

impl<T> Node<T> {
    /// Unlinked node.
    pub fn new(id: Identity, value: T) -> Self {
        Self {
            id,
            value,
            next: None,
            prev: None,
        }
    }

    /// Node that declares `prev` as its anchor, as carried by a remote insert.
    pub fn with_prev(id: Identity, value: T, prev: Option<Identity>) -> Self {
        Self {
            id,
            value,
            next: None,
            prev,
        }
    }

    pub fn precedes(&self, other: &Node<T>) -> bool {
        self.id.precedes(&other.id)
    }
}
