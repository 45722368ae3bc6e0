//! # tessera-core: replicated block document model
//!
//! A page is a list of blocks; every block owns a list of characters. Both
//! levels are the same identity-addressed doubly linked list, wrapped in a
//! Lamport-clocked CRDT:
//!
//! ```text
//! Editor (page_id)
//!   └── EditorCrdt = Crdt<Block>        clock, client
//!         └── LinkedList<Block>
//!               ├── Block ── TextCrdt = Crdt<Char>
//!               ├── Block ── TextCrdt
//!               └── ...
//! ```
//!
//! Local intent (`local_*`, or the [`Editor`] methods) mutates the replica
//! and yields an [`Operation`]. Operations received from the relay go
//! through [`Editor::apply`]. Concurrent inserts at the same anchor end up
//! in the order the relay delivered them, so every replica must see one
//! total order per page.
//!
//! ## Modules
//!
//! - [`identity`]: `(clock, client)` identifiers
//! - [`list`]: arena-backed linked list
//! - [`crdt`]: clocked wrapper and snapshots
//! - [`text`] / [`block`]: the two element kinds
//! - [`op`]: wire payloads
//! - [`editor`]: page composition
//! - [`replica`]: client view reconciled against the relay's order

pub mod block;
pub mod crdt;
pub mod editor;
pub mod error;
pub mod identity;
pub mod list;
pub mod node;
pub mod op;
pub mod replica;
pub mod text;

pub use block::{Block, BlockKind, EditorCrdt, MAX_INDENT};
pub use crdt::{
    Crdt, CrdtSnapshot, DeleteOp, InsertOp, ListSnapshot, ReorderOp, UpdateOp, INITIAL_CLOCK,
};
pub use editor::Editor;
pub use error::CrdtError;
pub use identity::{ClientId, Identity};
pub use list::LinkedList;
pub use node::{Element, Node};
pub use op::Operation;
pub use replica::{ApplyOutcome, OutboundBatch, Replica};
pub use text::{Char, Color, TextCrdt, TextStyle};
