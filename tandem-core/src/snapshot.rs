//! At-rest export of a document.
//!
//! A snapshot carries every integrated operation plus the state vector they
//! add up to. Loading one replays the operations, so two replicas hydrated
//! from the same snapshot hold identical operation ids and deduplicate each
//! other's traffic.

use serde::{Deserialize, Serialize};

use crate::{Operation, StateVector};

/// Current encoding version.
pub const SNAPSHOT_FORMAT: u8 = 1;

/// Upper bound on an encoded snapshot, guards decoding of corrupt blobs.
const MAX_SNAPSHOT_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format: u8,
    pub state_vector: StateVector,
    /// In causal order.
    pub operations: Vec<Operation>,
}

impl Snapshot {
    pub fn new(state_vector: StateVector, operations: Vec<Operation>) -> Self {
        Self {
            format: SNAPSHOT_FORMAT,
            state_vector,
            operations,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        bincode::serde::encode_to_vec(self, config())
            .map_err(|e| SnapshotError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let (snapshot, _): (Snapshot, usize) = bincode::serde::decode_from_slice(bytes, config())
            .map_err(|e| SnapshotError::Deserialization(e.to_string()))?;
        if snapshot.format != SNAPSHOT_FORMAT {
            return Err(SnapshotError::UnsupportedFormat(snapshot.format));
        }
        Ok(snapshot)
    }
}

fn config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_SNAPSHOT_BYTES>()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("snapshot serialization failed: {0}")]
    Serialization(String),
    #[error("snapshot deserialization failed: {0}")]
    Deserialization(String),
    #[error("unsupported snapshot format {0}")]
    UnsupportedFormat(u8),
}
