//! Logical identifiers for replicated elements.
//!
//! An [`Identity`] is minted exactly once, by the replica that creates the
//! element, and is never reused or mutated afterwards. It is the only legal
//! way to reference a node across replicas.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CrdtError;

/// Replica number assigned by the relay for the lifetime of a session.
pub type ClientId = u32;

/// `(clock, client)` pair naming one replicated element.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Author's Lamport clock when the element was created.
    pub clock: u64,
    /// Author's replica number.
    pub client: ClientId,
}

impl Identity {
    pub const fn new(clock: u64, client: ClientId) -> Self {
        Self { clock, client }
    }

    /// Tie-break order: lower clock first, then lower client.
    ///
    /// Not consulted by the list itself; delivery order from the relay
    /// decides the position of concurrent inserts at the same anchor.
    pub fn precedes(&self, other: &Identity) -> bool {
        self < other
    }

    /// Canonical string key, `"{clock}@{client}"`.
    pub fn to_key(&self) -> String {
        self.to_string()
    }
}

impl Ord for Identity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.clock
            .cmp(&other.clock)
            .then_with(|| self.client.cmp(&other.client))
    }
}

impl PartialOrd for Identity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.clock, self.client)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Identity({}@{})", self.clock, self.client)
    }
}

impl FromStr for Identity {
    type Err = CrdtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (clock, client) = s
            .split_once('@')
            .ok_or_else(|| CrdtError::Snapshot(format!("malformed identity key '{s}'")))?;
        let clock = clock
            .parse()
            .map_err(|_| CrdtError::Snapshot(format!("bad clock in identity key '{s}'")))?;
        let client = client
            .parse()
            .map_err(|_| CrdtError::Snapshot(format!("bad client in identity key '{s}'")))?;
        Ok(Self { clock, client })
    }
}
