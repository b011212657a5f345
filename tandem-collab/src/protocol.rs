//! Binary protocol for operation-based synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ replica   │ room     │ payload  │
//! │ 1 byte   │ 16 bytes  │ variable │ variable │
//! └──────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! Payloads are themselves bincode: a [`StateVector`] for `SyncStep1`, a
//! list of [`Operation`]s for `SyncStep2` and `Update`, empty otherwise.

use serde::{Deserialize, Serialize};
use tandem_core::{Operation, ReplicaId, StateVector};

/// Largest frame accepted from the wire.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Peer enters a room
    Join = 1,
    /// State vector, asking for what the sender is missing
    SyncStep1 = 2,
    /// Operations answering a SyncStep1
    SyncStep2 = 3,
    /// Operations produced after the handshake
    Update = 4,
    /// Peer leaves a room
    Leave = 5,
    /// Heartbeat ping
    Ping = 6,
    /// Heartbeat pong
    Pong = 7,
}

/// Top-level protocol message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Replica the message speaks for. For relayed updates this is the
    /// original author, not the relay.
    pub replica: ReplicaId,
    pub room: String,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn empty(msg_type: MessageType, replica: ReplicaId, room: &str) -> Self {
        Self {
            msg_type,
            replica,
            room: room.to_string(),
            payload: Vec::new(),
        }
    }

    pub fn join(replica: ReplicaId, room: &str) -> Self {
        Self::empty(MessageType::Join, replica, room)
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(
        replica: ReplicaId,
        room: &str,
        state_vector: &StateVector,
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            payload: encode_payload(state_vector)?,
            ..Self::empty(MessageType::SyncStep1, replica, room)
        })
    }

    /// Create a sync step 2 (missing operations).
    pub fn sync_step2(
        replica: ReplicaId,
        room: &str,
        operations: &[Operation],
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            payload: encode_payload(&operations)?,
            ..Self::empty(MessageType::SyncStep2, replica, room)
        })
    }

    /// Create an incremental update.
    pub fn update(
        replica: ReplicaId,
        room: &str,
        operations: &[Operation],
    ) -> Result<Self, ProtocolError> {
        Ok(Self {
            payload: encode_payload(&operations)?,
            ..Self::empty(MessageType::Update, replica, room)
        })
    }

    pub fn leave(replica: ReplicaId, room: &str) -> Self {
        Self::empty(MessageType::Leave, replica, room)
    }

    pub fn ping(replica: ReplicaId) -> Self {
        Self::empty(MessageType::Ping, replica, "")
    }

    pub fn pong(replica: ReplicaId) -> Self {
        Self::empty(MessageType::Pong, replica, "")
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() > MAX_FRAME_BYTES {
            return Err(ProtocolError::FrameTooLarge(bytes.len()));
        }
        let config = bincode::config::standard().with_limit::<MAX_FRAME_BYTES>();
        let (msg, _) = bincode::serde::decode_from_slice(bytes, config)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse a SyncStep1 payload.
    pub fn state_vector(&self) -> Result<StateVector, ProtocolError> {
        if self.msg_type != MessageType::SyncStep1 {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }

    /// Parse a SyncStep2 or Update payload.
    pub fn operations(&self) -> Result<Vec<Operation>, ProtocolError> {
        if !matches!(self.msg_type, MessageType::SyncStep2 | MessageType::Update) {
            return Err(ProtocolError::InvalidMessageType);
        }
        decode_payload(&self.payload)
    }
}

fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtocolError> {
    bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, ProtocolError> {
    let config = bincode::config::standard().with_limit::<MAX_FRAME_BYTES>();
    let (value, _) = bincode::serde::decode_from_slice(bytes, config)
        .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
    Ok(value)
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),
    #[error("Invalid message type")]
    InvalidMessageType,
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Connection timeout")]
    Timeout,
}
