//! Error taxonomy shared by every courier crate.

use std::time::Duration;

/// Typed error hierarchy for the messaging transport.
///
/// Classified the way callers have to react: connection errors are pushed to
/// `on_error` callbacks and retried by the supervisor, validation and
/// not-connected errors are returned straight to the caller of `send`, and
/// decode errors never leave the dispatcher.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CourierError {
    // Connection
    #[error("no bearer token available")]
    MissingCredentials,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("connection rejected: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no heartbeat received within {0:?}")]
    HeartbeatTimeout(Duration),

    // Caller-facing
    #[error("invalid envelope: `{field}` is required")]
    Validation { field: &'static str },
    #[error("not connected")]
    NotConnected,

    // Codec
    #[error("malformed frame: {0}")]
    Decode(String),
    #[error("failed to encode envelope: {0}")]
    Encode(String),

    // Environment
    #[error("no async runtime available to drive the connection")]
    NoRuntime,
}

/// Result alias used across the courier crates.
pub type Result<T> = std::result::Result<T, CourierError>;

impl CourierError {
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::MissingCredentials
                | Self::Handshake(_)
                | Self::Rejected(_)
                | Self::Transport(_)
                | Self::HeartbeatTimeout(_)
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }

    pub fn is_not_connected(&self) -> bool {
        matches!(self, Self::NotConnected)
    }

    /// Whether the supervisor's automatic reconnect may clear this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Handshake(_) | Self::Transport(_) | Self::HeartbeatTimeout(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::MissingCredentials => "missing_credentials",
            Self::Handshake(_) => "handshake",
            Self::Rejected(_) => "rejected",
            Self::Transport(_) => "transport",
            Self::HeartbeatTimeout(_) => "heartbeat_timeout",
            Self::Validation { .. } => "validation",
            Self::NotConnected => "not_connected",
            Self::Decode(_) => "decode",
            Self::Encode(_) => "encode",
            Self::NoRuntime => "no_runtime",
        }
    }
}
