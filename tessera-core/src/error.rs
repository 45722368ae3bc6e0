use thiserror::Error;
use uuid::Uuid;

use crate::identity::Identity;

/// Errors raised while mutating or reading a replicated list.
///
/// Local errors (bad index from the UI) are caller bugs. Remote errors
/// (`DanglingReference`) are expected under concurrent deletes and are
/// dropped by [`Editor::apply_logged`](crate::Editor::apply_logged).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CrdtError {
    #[error("index {index} is out of range for a list of {len} elements")]
    InvalidIndex { index: usize, len: usize },

    #[error("identity {0} is not present in this replica")]
    DanglingReference(Identity),

    #[error("expected an element but the list is empty")]
    EmptyList,

    #[error("identity {0} already exists in this replica")]
    DuplicateIdentity(Identity),

    #[error("linked list chain is corrupted: {0}")]
    CorruptedChain(String),

    #[error("operation targets page {found} but this editor holds page {expected}")]
    PageMismatch { expected: Uuid, found: Uuid },

    #[error("invalid snapshot: {0}")]
    Snapshot(String),

    /// The Lamport clock cannot advance past `u64::MAX`.
    #[error("logical clock exhausted")]
    ClockOverflow,
}
