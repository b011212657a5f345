//! # tandem-collab — Replication, persistence and sessions for Tandem
//!
//! Moves [`tandem_core`] operations between replicas through a relay and
//! keeps each room's document durable.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   Link (frames)    ┌─────────────┐
//! │ Session     │ ◄────────────────► │ Relay       │
//! │ (per user)  │   Binary Proto     │ (per room)  │
//! └──────┬──────┘                    └──────┬──────┘
//!        │                                  │
//!        ▼                                  ▼
//! ┌─────────────┐                    ┌──────────────┐
//! │ Document    │                    │ Document     │
//! │ + Autosave  │                    │ + Broadcast  │
//! └──────┬──────┘                    └──────┬───────┘
//!        ▼                                  ▼
//!   SnapshotStore                     SnapshotStore
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — Binary wire protocol (bincode-encoded SyncMessage)
//! - [`broadcast`] — Room fan-out with lag detection
//! - [`transport`] — Connection state machine, handshake, reconnect
//! - [`relay`] — WebSocket relay and in-process connector
//! - [`reconciler`] — Hydration and autosave
//! - [`storage`] — Snapshot stores (memory, RocksDB)
//! - [`session`] — One open document: edits, undo, lifecycle

use std::sync::Arc;
use tokio::sync::Mutex;

use tandem_core::Document;

pub mod broadcast;
pub mod protocol;
pub mod reconciler;
pub mod relay;
pub mod session;
pub mod storage;
pub mod transport;

/// A document shared between a session, its transport and its autosave.
pub type DocHandle = Arc<Mutex<Document>>;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Frame};
pub use protocol::{MessageType, ProtocolError, SyncMessage};
pub use reconciler::{hydrate, persist_now, Autosave, AutosaveStats, HydrationOutcome};
pub use relay::{LocalConnector, Relay, RelayConfig, RelayStats};
pub use session::{Session, SessionConfig};
pub use storage::{
    DocumentMetadata, MemoryStore, RocksStore, SnapshotStore, StoreConfig, StoreError,
};
pub use transport::{
    BackoffPolicy, Connection, ConnectionState, Connector, Link, TransportConfig, TransportError,
    TransportEvent, WebSocketConnector,
};
