//! Settings schema.
//!
//! Field names are camelCase on disk; every struct fills missing keys from
//! its `Default`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object (`~/.courier/settings.json`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CourierSettings {
    /// Real-time transport settings.
    pub transport: TransportSettings,
    /// Log output settings.
    pub logging: LoggingSettings,
}

impl CourierSettings {
    /// Reject values the transport cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.transport.validate()
    }
}

/// Connection, routing and liveness settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportSettings {
    /// WebSocket endpoint of the message broker.
    pub url: String,
    /// Value of the `host` header in `CONNECT`.
    pub virtual_host: String,
    /// Single destination every outbound envelope is sent to.
    pub send_destination: String,
    /// Prefix joined with a topic key to form its subscribe destination.
    pub topic_prefix: String,
    /// Fixed delay between reconnect attempts, in milliseconds.
    pub reconnect_delay_ms: u64,
    /// Give up after this many consecutive failed attempts (`None` = never).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reconnect_attempts: Option<u32>,
    /// Timeout for opening the link plus the `CONNECTED` reply, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Heartbeat interval we offer to send, in milliseconds (0 = none).
    pub heartbeat_outgoing_ms: u64,
    /// Heartbeat interval we ask the broker for, in milliseconds (0 = none).
    pub heartbeat_incoming_ms: u64,
    /// Outbound frame queue depth per connection.
    pub outbound_queue_capacity: usize,
    /// Largest inbound frame accepted, in bytes.
    pub max_frame_size: usize,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            virtual_host: "/".to_string(),
            send_destination: "/app/chat.send".to_string(),
            topic_prefix: "/topic".to_string(),
            reconnect_delay_ms: 5_000,
            max_reconnect_attempts: None,
            connect_timeout_ms: 10_000,
            heartbeat_outgoing_ms: 10_000,
            heartbeat_incoming_ms: 10_000,
            outbound_queue_capacity: 256,
            max_frame_size: 1024 * 1024,
        }
    }
}

impl TransportSettings {
    /// Reject values the transport cannot run with.
    pub fn validate(&self) -> Result<()> {
        if !(self.url.starts_with("ws://") || self.url.starts_with("wss://")) {
            return Err(SettingsError::invalid(
                "transport.url",
                format!("expected a ws:// or wss:// URL, got {:?}", self.url),
            ));
        }
        if self.send_destination.trim().is_empty() {
            return Err(SettingsError::invalid(
                "transport.sendDestination",
                "must not be empty",
            ));
        }
        for (key, value) in [
            ("transport.reconnectDelayMs", self.reconnect_delay_ms),
            ("transport.connectTimeoutMs", self.connect_timeout_ms),
        ] {
            if value == 0 {
                return Err(SettingsError::invalid(key, "must be > 0"));
            }
        }
        if self.outbound_queue_capacity == 0 {
            return Err(SettingsError::invalid(
                "transport.outboundQueueCapacity",
                "must be > 0",
            ));
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable single-line output.
    Compact,
}

/// Log level and format settings. `RUST_LOG` wins over both when set.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Per-module overrides, e.g. `{"courier_transport": "debug"}`.
    pub module_levels: BTreeMap<String, String>,
    /// Output format.
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            module_levels: BTreeMap::new(),
            format: LogFormat::Json,
        }
    }
}
