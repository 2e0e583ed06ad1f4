//! Presence delta wire format.
//!
//! A delta is one net presence change on a channel: a user became present
//! (`enter`, live-session count 0→1) or absent (`leave`, count 1→0).
//! Deltas are CBOR-encoded; the per-channel sequence id travels in the bus
//! message envelope, not in the payload.
//!
//! The kind tag is a closed enum. A payload carrying an unknown tag fails
//! decoding, which callers treat as a protocol violation scoped to that one
//! message.

use serde::{Deserialize, Serialize};

use crate::types::UserId;

/// Kind of presence transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaKind {
    /// A user's first live session appeared.
    #[serde(rename = "enter")]
    Enter,
    /// A user's last live session disappeared.
    #[serde(rename = "leave")]
    Leave,
}

/// One presence change, as published on a channel's topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delta {
    /// Transition kind.
    #[serde(rename = "type")]
    pub kind: DeltaKind,
    /// The user whose presence changed.
    pub user_id: UserId,
}

/// Errors encoding or decoding a delta payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// CBOR encoding failed.
    #[error("delta encoding failed: {0}")]
    Encode(String),

    /// CBOR decoding failed (truncated payload, unknown kind tag, ...).
    #[error("delta decoding failed: {0}")]
    Decode(String),
}

impl Delta {
    /// Create a delta.
    pub fn new(kind: DeltaKind, user_id: UserId) -> Self {
        Self { kind, user_id }
    }

    /// Encode to CBOR bytes.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Decode from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        ciborium::from_reader(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let delta = Delta::new(DeltaKind::Enter, 42);
        let decoded = Delta::decode(&delta.encode().unwrap()).unwrap();
        assert_eq!(decoded, delta);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        // Hand-build a payload with a kind tag outside the closed set.
        #[derive(Serialize)]
        struct Bogus {
            #[serde(rename = "type")]
            kind: String,
            user_id: u64,
        }

        let mut buf = Vec::new();
        ciborium::into_writer(&Bogus { kind: "vanish".to_string(), user_id: 7 }, &mut buf)
            .unwrap();

        assert!(matches!(Delta::decode(&buf), Err(CodecError::Decode(_))));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let bytes = Delta::new(DeltaKind::Leave, 1).encode().unwrap();
        assert!(Delta::decode(&bytes[..bytes.len() - 1]).is_err());
    }
}
