//! Topic keys: the unit of subscription deduplication.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Path segment every per-recipient topic starts with.
pub const TOPIC_ROOT: &str = "messages";

/// Key for one logical inbound stream.
///
/// In this domain there is one topic per recipient identity, so every UI
/// surface a user has open shares the same `messages/{recipientId}` key.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Topic carrying messages addressed to `recipient_id`.
    pub fn for_recipient(recipient_id: &str) -> Self {
        Self(format!("{TOPIC_ROOT}/{}", recipient_id.trim()))
    }

    /// Use an arbitrary key as-is.
    pub fn from_raw(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recipient id if this key follows the `messages/{id}` convention.
    pub fn recipient(&self) -> Option<&str> {
        self.0
            .strip_prefix(TOPIC_ROOT)
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|id| !id.is_empty())
    }

    /// Wire destination under `prefix` (e.g. `/topic/messages/U1`).
    pub fn destination(&self, prefix: &str) -> String {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            format!("/{}", self.0)
        } else {
            format!("{prefix}/{}", self.0)
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Topic {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
