//! Wire envelope for the document sync channel.
//!
//! Three message kinds travel on a document's broadcast channel:
//!
//! - `Update` — an incremental CRDT delta produced by a local edit
//! - `SyncRequest` — broadcast by a freshly joined client asking peers for
//!   a full-state snapshot
//! - `SyncResponse` — a full-state snapshot, sent by any already-synced peer
//!
//! Messages are bincode-encoded. The timestamp is unix milliseconds and is
//! informational only: the transport gives no ordering guarantee and the
//! CRDT merge is what arbitrates concurrent writers, so nothing in the
//! protocol makes ordering decisions from it.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Message kinds for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Incremental CRDT delta update
    Update,
    /// Full-state snapshot request from a newly joined client
    SyncRequest,
    /// Full-state snapshot reply
    SyncResponse,
}

/// Top-level envelope for the document channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub kind: MessageKind,
    /// Binary delta (`Update`), full snapshot (`SyncResponse`), or empty
    /// (`SyncRequest`).
    pub payload: Vec<u8>,
    /// Unix milliseconds at send time.
    pub timestamp: u64,
}

impl SyncMessage {
    /// Create an incremental update message.
    pub fn update(delta: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::Update,
            payload: delta,
            timestamp: unix_millis(),
        }
    }

    /// Create a sync request (no payload).
    pub fn sync_request() -> Self {
        Self {
            kind: MessageKind::SyncRequest,
            payload: Vec::new(),
            timestamp: unix_millis(),
        }
    }

    /// Create a sync response carrying a full-state snapshot.
    pub fn sync_response(snapshot: Vec<u8>) -> Self {
        Self {
            kind: MessageKind::SyncResponse,
            payload: snapshot,
            timestamp: unix_millis(),
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }
}

/// Current wall-clock time as unix milliseconds.
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_roundtrip() {
        let delta = vec![1, 2, 3, 4, 5];
        let msg = SyncMessage::update(delta.clone());
        let encoded = msg.encode().unwrap();
        let decoded = SyncMessage::decode(&encoded).unwrap();

        assert_eq!(decoded.kind, MessageKind::Update);
        assert_eq!(decoded.payload, delta);
        assert_eq!(decoded.timestamp, msg.timestamp);
    }

    #[test]
    fn test_sync_request_roundtrip() {
        let msg = SyncMessage::sync_request();
        let encoded = msg.encode().unwrap();
        let decoded = SyncMessage::decode(&encoded).unwrap();

        assert_eq!(decoded.kind, MessageKind::SyncRequest);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_sync_response_roundtrip() {
        let snapshot = vec![10u8; 256];
        let msg = SyncMessage::sync_response(snapshot.clone());
        let encoded = msg.encode().unwrap();
        let decoded = SyncMessage::decode(&encoded).unwrap();

        assert_eq!(decoded.kind, MessageKind::SyncResponse);
        assert_eq!(decoded.payload, snapshot);
    }

    #[test]
    fn test_decode_invalid_bytes() {
        let garbage = vec![0xFF, 0xFE, 0xFD];
        assert!(SyncMessage::decode(&garbage).is_err());
    }

    #[test]
    fn test_timestamp_populated() {
        let msg = SyncMessage::sync_request();
        // Well after 2020-01-01 in unix millis.
        assert!(msg.timestamp > 1_577_836_800_000);
    }

    #[test]
    fn test_empty_update() {
        let msg = SyncMessage::update(Vec::new());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_large_snapshot() {
        // Simulate a large document snapshot: 64KB
        let snapshot = vec![42u8; 65536];
        let msg = SyncMessage::sync_response(snapshot.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded.payload, snapshot);
    }
}
