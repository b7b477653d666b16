//! Binary wire protocol spoken between peers and the relay.
//!
//! Every frame is a tagged union, bincode-encoded:
//! ```text
//! ┌─────────┬──────────────────────────────────────────────────────────┐
//! │ variant │ fields                                                   │
//! ├─────────┼──────────────────────────────────────────────────────────┤
//! │ Join    │ sender_id, peer_metadata?, supported_protocol_versions   │
//! │ Peer    │ sender_id, peer_metadata?, target_id, selected_version   │
//! │ Data    │ message_type, sender_id, target_id?, document_id?, bytes │
//! └─────────┴──────────────────────────────────────────────────────────┘
//! ```
//!
//! The relay only looks at the handshake variants and at the sender/target
//! fields. Data payloads belong to the merge engine and pass through untouched.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// The only protocol version this relay speaks.
pub const PROTOCOL_VERSION: &str = "1";

/// Upper bound on a single encoded frame.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

fn wire_config() -> impl bincode::config::Config {
    bincode::config::standard().with_limit::<MAX_FRAME_BYTES>()
}

/// Stable identifier of a remote party (or of the relay itself).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Attributes a peer announces about itself at join time.
///
/// The relay stores and forwards these without acting on them.
/// `PeerMetadata::default()` is the "no metadata" value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerMetadata {
    /// Identifier of the peer's durable storage, if it has one
    pub storage_id: Option<String>,
    /// Ephemeral peers keep no local copy worth syncing against
    pub is_ephemeral: bool,
}

/// An engine-defined message the relay routes but never interprets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataMessage {
    /// Engine-level message type, e.g. "sync" or "ephemeral"
    pub message_type: String,
    pub sender_id: PeerId,
    /// Unicast destination; `None` means broadcast
    pub target_id: Option<PeerId>,
    pub document_id: Option<String>,
    pub payload: Vec<u8>,
}

/// One decoded protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame a peer sends on a fresh connection.
    Join {
        sender_id: PeerId,
        peer_metadata: Option<PeerMetadata>,
        supported_protocol_versions: Vec<String>,
    },
    /// Handshake reply identifying the other side.
    Peer {
        sender_id: PeerId,
        peer_metadata: Option<PeerMetadata>,
        target_id: PeerId,
        selected_protocol_version: String,
    },
    Data(DataMessage),
}

impl Frame {
    /// Build a join frame advertising the current protocol version.
    pub fn join(sender_id: impl Into<PeerId>, peer_metadata: Option<PeerMetadata>) -> Self {
        Frame::Join {
            sender_id: sender_id.into(),
            peer_metadata,
            supported_protocol_versions: vec![PROTOCOL_VERSION.to_string()],
        }
    }

    /// Build the relay's handshake reply to `target_id`.
    pub fn peer(
        sender_id: PeerId,
        peer_metadata: Option<PeerMetadata>,
        target_id: PeerId,
    ) -> Self {
        Frame::Peer {
            sender_id,
            peer_metadata,
            target_id,
            selected_protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }

    /// Build a data message. `target_id = None` broadcasts.
    pub fn data(
        message_type: impl Into<String>,
        sender_id: impl Into<PeerId>,
        target_id: Option<PeerId>,
        payload: Vec<u8>,
    ) -> Self {
        Frame::Data(DataMessage {
            message_type: message_type.into(),
            sender_id: sender_id.into(),
            target_id,
            document_id: None,
            payload,
        })
    }

    /// The frame's type tag as it appears on the wire.
    pub fn kind(&self) -> &str {
        match self {
            Frame::Join { .. } => "join",
            Frame::Peer { .. } => "peer",
            Frame::Data(msg) => &msg.message_type,
        }
    }

    pub fn sender_id(&self) -> &PeerId {
        match self {
            Frame::Join { sender_id, .. } | Frame::Peer { sender_id, .. } => sender_id,
            Frame::Data(msg) => &msg.sender_id,
        }
    }

    /// Unicast destination. Join frames never carry one.
    pub fn target_id(&self) -> Option<&PeerId> {
        match self {
            Frame::Join { .. } => None,
            Frame::Peer { target_id, .. } => Some(target_id),
            Frame::Data(msg) => msg.target_id.as_ref(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, wire_config())
            .map_err(|e| ProtocolError::Encode(e.to_string()))
    }

    /// Deserialize from binary wire format.
    ///
    /// The whole buffer must be consumed by exactly one frame.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (frame, read) = bincode::serde::decode_from_slice(bytes, wire_config())
            .map_err(|e| ProtocolError::Decode(e.to_string()))?;
        if read != bytes.len() {
            return Err(ProtocolError::TrailingBytes(bytes.len() - read));
        }
        Ok(frame)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Encode(String),
    #[error("Deserialization error: {0}")]
    Decode(String),
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
}
