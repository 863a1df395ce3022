//! Wire protocol.
//!
//! Every frame is one JSON object tagged by `type`:
//!
//! ```json
//! {"type":"propose","key":"counter","value":1,"baseVersion":0}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Why a proposal was turned down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RejectReason {
    /// The key's validator returned false (or panicked).
    ValidationFailed,

    /// Another proposal was committed against the same base version first.
    StaleVersion,

    /// No entry is registered under the key.
    UnknownKey,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RejectReason::ValidationFailed => "validation failed",
            RejectReason::StaleVersion => "stale base version",
            RejectReason::UnknownKey => "unknown key",
        };
        f.write_str(text)
    }
}

/// A protocol message in either direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Envelope {
    /// Client asks for a key's value and all future changes.
    Subscribe { key: String },

    Unsubscribe { key: String },

    /// Client wants `value` committed, assuming `base_version` is current.
    Propose {
        key: String,
        value: Value,
        #[serde(rename = "baseVersion")]
        base_version: u64,
    },

    /// Authoritative value of a key.
    Update {
        key: String,
        value: Value,
        version: u64,
    },

    /// The origin's proposal was committed as `version`.
    Ack { key: String, version: u64 },

    Rejected {
        key: String,
        reason: RejectReason,
        #[serde(rename = "canonicalValue")]
        canonical_value: Value,
        #[serde(rename = "canonicalVersion")]
        canonical_version: u64,
    },

    /// Sent before the server drops a connection for a protocol violation.
    Error { message: String },
}

impl Envelope {
    /// The envelope's `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Subscribe { .. } => "subscribe",
            Envelope::Unsubscribe { .. } => "unsubscribe",
            Envelope::Propose { .. } => "propose",
            Envelope::Update { .. } => "update",
            Envelope::Ack { .. } => "ack",
            Envelope::Rejected { .. } => "rejected",
            Envelope::Error { .. } => "error",
        }
    }

    /// The key the envelope refers to, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Envelope::Subscribe { key }
            | Envelope::Unsubscribe { key }
            | Envelope::Propose { key, .. }
            | Envelope::Update { key, .. }
            | Envelope::Ack { key, .. }
            | Envelope::Rejected { key, .. } => Some(key),
            Envelope::Error { .. } => None,
        }
    }
}

/// Encode an envelope as a text frame payload.
pub fn encode(envelope: &Envelope) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(envelope)?)
}

/// Decode a text frame payload.
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn propose_uses_camel_case_fields() {
        let text = encode(&Envelope::Propose {
            key: "counter".into(),
            value: json!(1),
            base_version: 0,
        })
        .unwrap();

        let raw: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(
            raw,
            json!({"type": "propose", "key": "counter", "value": 1, "baseVersion": 0})
        );
    }

    #[test]
    fn decodes_rejected() {
        let envelope = decode(
            r#"{"type":"rejected","key":"counter","reason":"staleVersion","canonicalValue":1,"canonicalVersion":1}"#,
        )
        .unwrap();

        assert_eq!(
            envelope,
            Envelope::Rejected {
                key: "counter".into(),
                reason: RejectReason::StaleVersion,
                canonical_value: json!(1),
                canonical_version: 1,
            }
        );
        assert_eq!(envelope.kind(), "rejected");
        assert_eq!(envelope.key(), Some("counter"));
    }

    #[test]
    fn malformed_frames_are_protocol_errors() {
        assert!(matches!(decode("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(
            decode(r#"{"type":"teleport","key":"x"}"#),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            decode(r#"{"type":"propose","key":"x","value":1}"#),
            Err(ProtocolError::Malformed(_))
        ));
    }
}
