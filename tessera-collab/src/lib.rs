//! # tessera-collab: relay and sync client for Tessera pages
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌──────────────┐
//! │ SyncClient  │ ◄────────────────► │ SyncServer   │
//! │ (per user)  │   bincode frames   │ (relay)      │
//! └──────┬──────┘                    └──────┬───────┘
//!        │                                  │
//!        ▼                                  ▼
//! ┌─────────────┐                    ┌──────────────┐
//! │ Replica     │                    │ Room         │
//! │ visible +   │                    │ authoritative│
//! │ confirmed   │                    │ Editor, seq  │
//! └─────────────┘                    └──────┬───────┘
//!                                           │
//!                                 ┌─────────┴─────────┐
//!                                 │ BroadcastGroup    │
//!                                 │ SnapshotStore     │
//!                                 └───────────────────┘
//! ```
//!
//! The relay is the only place operations are ordered. Each room applies
//! submitted batches one at a time and rebroadcasts them with a sequence
//! number; clients replay their unacknowledged edits on top of that order.
//!
//! ## Modules
//!
//! - [`protocol`]: wire messages
//! - [`broadcast`]: per-room fan-out
//! - [`room`]: sequencer and room registry
//! - [`storage`]: snapshot stores (memory, RocksDB)
//! - [`server`]: WebSocket relay
//! - [`client`]: WebSocket client with offline editing
//! - [`batch`]: outbound flush policy

pub mod batch;
pub mod broadcast;
pub mod client;
pub mod protocol;
pub mod room;
pub mod server;
pub mod storage;

pub use batch::FlushPolicy;
pub use broadcast::{BroadcastGroup, BroadcastStats, Participant};
pub use client::{ClientConfig, ConnectionState, SyncClient, SyncEvent};
pub use protocol::{MessageType, OperationBatch, PeerInfo, ProtocolError, SyncMessage, Welcome};
pub use room::{Joined, RegistryConfig, Room, RoomError, RoomRegistry, Submitted, RELAY_CLIENT};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use storage::{
    DocumentStore, MemoryStore, PageRecord, SnapshotStore, StoreConfig, StoreError, StoredPage,
};
