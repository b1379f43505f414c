//! The chat message payload carried inside frame bodies.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{CourierError, Result};

/// Message type used when the caller does not pick one.
pub const DEFAULT_MESSAGE_KIND: &str = "TEXT";

/// Wire shape: `{ senderId, recipientId, content, type, timestamp }`.
///
/// Inbound envelopes are immutable once decoded; outbound envelopes are
/// built fresh for every publish via [`MessageEnvelope::new`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    /// Who sent the message.
    pub sender_id: String,
    /// Who the backend should route it to.
    pub recipient_id: String,
    /// Message body.
    pub content: String,
    /// Message type (`TEXT`, `IMAGE`, ...).
    #[serde(rename = "type", default = "default_kind")]
    pub kind: String,
    /// RFC 3339 timestamp.
    #[serde(default)]
    pub timestamp: String,
}

fn default_kind() -> String {
    DEFAULT_MESSAGE_KIND.to_string()
}

impl MessageEnvelope {
    /// Build an outbound envelope stamped with the current UTC time.
    pub fn new(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        content: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            content: content.into(),
            kind: kind.into(),
            timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    /// Shorthand for a `TEXT` message.
    pub fn text(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self::new(sender_id, recipient_id, content, DEFAULT_MESSAGE_KIND)
    }

    /// Check the fields required for publishing.
    ///
    /// `senderId`, `recipientId` and `content` must be non-blank, checked in
    /// that order so the first missing field is reported.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("senderId", &self.sender_id),
            ("recipientId", &self.recipient_id),
            ("content", &self.content),
        ] {
            if value.trim().is_empty() {
                return Err(CourierError::Validation { field });
            }
        }
        Ok(())
    }

    /// Serialize to the JSON frame body.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| CourierError::Encode(e.to_string()))
    }

    /// Parse a frame body.
    pub fn from_json(body: &str) -> Result<Self> {
        serde_json::from_str(body).map_err(|e| CourierError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn new_stamps_timestamp() {
        let env = MessageEnvelope::text("U9", "U1", "hello");
        assert_eq!(env.kind, "TEXT");
        assert!(env.timestamp.ends_with('Z'), "got: {}", env.timestamp);
        assert!(chrono::DateTime::parse_from_rfc3339(&env.timestamp).is_ok());
    }

    #[test]
    fn wire_keys_are_camel_case() {
        let env = MessageEnvelope::new("U9", "U1", "hello", "TEXT");
        let value: serde_json::Value = serde_json::from_str(&env.to_json().unwrap()).unwrap();
        assert_eq!(value["senderId"], "U9");
        assert_eq!(value["recipientId"], "U1");
        assert_eq!(value["content"], "hello");
        assert_eq!(value["type"], "TEXT");
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn decode_full_envelope() {
        let body = r#"{"senderId":"U9","recipientId":"U1","content":"hello","type":"TEXT","timestamp":"2024-01-01T00:00:00Z"}"#;
        let env = MessageEnvelope::from_json(body).unwrap();
        assert_eq!(env.sender_id, "U9");
        assert_eq!(env.timestamp, "2024-01-01T00:00:00Z");
    }

    #[test]
    fn decode_defaults_optional_fields() {
        let body = r#"{"senderId":"U9","recipientId":"U1","content":"hi"}"#;
        let env = MessageEnvelope::from_json(body).unwrap();
        assert_eq!(env.kind, DEFAULT_MESSAGE_KIND);
        assert!(env.timestamp.is_empty());
    }

    #[test]
    fn decode_rejects_missing_required_field() {
        let err = MessageEnvelope::from_json(r#"{"senderId":"U9","content":"hi"}"#).unwrap_err();
        assert_matches!(err, CourierError::Decode(_));
    }

    #[test]
    fn decode_rejects_garbage() {
        assert_matches!(
            MessageEnvelope::from_json("not json"),
            Err(CourierError::Decode(_))
        );
    }

    #[test]
    fn validate_accepts_complete() {
        assert!(MessageEnvelope::text("U1", "U2", "hi").validate().is_ok());
    }

    #[test]
    fn validate_reports_first_missing_field() {
        let env = MessageEnvelope::text("", "", "");
        assert_matches!(
            env.validate(),
            Err(CourierError::Validation { field: "senderId" })
        );
        let env = MessageEnvelope::text("U1", "  ", "hi");
        assert_matches!(
            env.validate(),
            Err(CourierError::Validation { field: "recipientId" })
        );
        let env = MessageEnvelope::text("U1", "U2", "\n");
        assert_matches!(
            env.validate(),
            Err(CourierError::Validation { field: "content" })
        );
    }
}
