//! Binary protocol for room synchronization.
//!
//! Wire format (bincode-encoded, one message per WebSocket binary frame):
//! ```text
//! ┌──────────┬───────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ varint   │ variable │
//! └──────────┴───────────┴──────────┴──────────┘
//! ```
//!
//! The room is not part of the frame: a connection is bound to exactly one
//! room by its handshake path, so every frame on it belongs to that room.
//!
//! Handshake:
//! ```text
//! server                          client
//!   │── SyncStep1(server sv) ──────►│
//!   │◄────── SyncStep2(client diff)─│
//!   │◄────── SyncStep1(client sv) ──│
//!   │── SyncStep2(server diff) ────►│   (session is now Live)
//!   │◄──────────── Update ─────────►│
//!   │◄─────────── Awareness ───────►│
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presence::PresenceState;

/// Peer id used for frames originating from the server itself.
pub const SERVER_PEER: Uuid = Uuid::nil();

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector, asks the receiver for what the sender is missing
    SyncStep1 = 1,
    /// Yrs diff answering a SyncStep1
    SyncStep2 = 2,
    /// Incremental CRDT update
    Update = 3,
    /// Presence record of the sender (replaces the previous one)
    Awareness = 4,
    /// Peer left the room, its presence must be dropped
    PeerLeft = 5,
    /// Heartbeat ping
    Ping = 6,
    /// Heartbeat pong
    Pong = 7,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Connection that produced the message, `SERVER_PEER` for the server
    pub peer_id: Uuid,
    /// Per-sender sequence number, informational only
    pub clock: u64,
    /// Message payload (varies by msg_type)
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, clock: u64, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            clock,
            payload,
        }
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(peer_id: Uuid, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, 0, state_vector)
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(peer_id: Uuid, diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, 0, diff)
    }

    /// Create an incremental update message.
    pub fn update(peer_id: Uuid, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self::new(MessageType::Update, peer_id, clock, yrs_update)
    }

    /// Create an awareness message carrying the sender's presence.
    pub fn awareness(
        peer_id: Uuid,
        clock: u64,
        state: &PresenceState,
    ) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(state, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(Self::new(MessageType::Awareness, peer_id, clock, payload))
    }

    /// Create a peer left notification.
    pub fn peer_left(peer_id: Uuid) -> Self {
        Self::new(MessageType::PeerLeft, peer_id, 0, Vec::new())
    }

    /// Create a ping message.
    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, 0, Vec::new())
    }

    /// Create a pong message.
    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, 0, Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    ///
    /// Trailing bytes after a complete message are treated as malformed.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::TrailingBytes(bytes.len() - read));
        }
        Ok(msg)
    }

    /// Parse the presence payload of an awareness message.
    pub fn presence_state(&self) -> Result<PresenceState, ProtocolError> {
        if self.msg_type != MessageType::Awareness {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (state, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        Ok(state)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Encode(String),
    #[error("Deserialization error: {0}")]
    Decode(String),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
    #[error("Invalid message type: {0:?}")]
    InvalidMessageType(MessageType),
    #[error("Text frames are not part of the protocol")]
    TextFrame,
    #[error("Connection closed")]
    ConnectionClosed,
}
