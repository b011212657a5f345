//! Snapshot persistence for collaborative documents.
//!
//! ```text
//! ┌─────────────┐   save(room, snapshot)   ┌───────────────┐
//! │ Autosave /  │ ───────────────────────► │ SnapshotStore │
//! │ Relay       │ ◄─────────────────────── │               │
//! └─────────────┘   load(room)             └───────┬───────┘
//!                                                  │
//!                                   ┌──────────────┴──────────────┐
//!                                   ▼                             ▼
//!                             MemoryStore                    RocksStore
//!                      (tests, fault injection)     CF "snapshots" (LZ4)
//!                                                   CF "metadata"
//! ```
//!
//! A store keeps exactly one snapshot per room; saving replaces it.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, RocksStore, StoreConfig};

use async_trait::async_trait;
use tandem_core::{Snapshot, SnapshotError};

/// Durable storage keyed by room id.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// The stored snapshot for `room`, `None` if there is none.
    async fn load(&self, room: &str) -> Result<Option<Snapshot>, StoreError>;

    /// Replace the stored snapshot for `room`.
    async fn save(&self, room: &str, snapshot: &Snapshot) -> Result<(), StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    #[error("Database error: {0}")]
    Database(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<SnapshotError> for StoreError {
    fn from(e: SnapshotError) -> Self {
        match e {
            SnapshotError::Serialization(msg) => StoreError::Serialization(msg),
            other => StoreError::Deserialization(other.to_string()),
        }
    }
}
