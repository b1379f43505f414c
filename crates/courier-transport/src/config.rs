//! Runtime transport configuration.

use std::time::Duration;

use courier_settings::TransportSettings;

use crate::protocol::HeartbeatConfig;

/// `Duration`-typed form of [`TransportSettings`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransportConfig {
    /// Broker endpoint.
    pub url: String,
    /// `host` header sent in `CONNECT`.
    pub virtual_host: String,
    /// Destination of every outbound envelope.
    pub send_destination: String,
    /// Prefix for topic subscribe destinations.
    pub topic_prefix: String,
    /// Fixed wait between a failure and the next attempt.
    pub reconnect_delay: Duration,
    /// Consecutive failures tolerated before the driver gives up.
    pub max_reconnect_attempts: Option<u32>,
    /// Bound on opening the link and on waiting for `CONNECTED`, each.
    pub connect_timeout: Duration,
    /// Heart-beat offer.
    pub heartbeat: HeartbeatConfig,
    /// Outbound frame queue depth.
    pub outbound_queue_capacity: usize,
    /// Largest inbound frame accepted, in bytes.
    pub max_frame_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::from_settings(&TransportSettings::default())
    }
}

impl TransportConfig {
    /// Convert loaded settings.
    pub fn from_settings(settings: &TransportSettings) -> Self {
        Self {
            url: settings.url.clone(),
            virtual_host: settings.virtual_host.clone(),
            send_destination: settings.send_destination.clone(),
            topic_prefix: settings.topic_prefix.clone(),
            reconnect_delay: Duration::from_millis(settings.reconnect_delay_ms),
            max_reconnect_attempts: settings.max_reconnect_attempts,
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            heartbeat: HeartbeatConfig {
                outgoing: Duration::from_millis(settings.heartbeat_outgoing_ms),
                incoming: Duration::from_millis(settings.heartbeat_incoming_ms),
            },
            outbound_queue_capacity: settings.outbound_queue_capacity.max(1),
            max_frame_size: settings.max_frame_size,
        }
    }

    /// Override the endpoint.
    #[must_use]
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    /// Override the reconnect delay.
    #[must_use]
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    /// Cap consecutive reconnect attempts.
    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: Option<u32>) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Override the heart-beat offer.
    #[must_use]
    pub fn with_heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    /// Override the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_settings() {
        let config = TransportConfig::default();
        assert_eq!(config.url, "ws://127.0.0.1:8080/ws");
        assert_eq!(config.send_destination, "/app/chat.send");
        assert_eq!(config.reconnect_delay, Duration::from_secs(5));
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.heartbeat.outgoing, Duration::from_secs(10));
        assert_eq!(config.heartbeat.incoming, Duration::from_secs(10));
        assert!(config.max_reconnect_attempts.is_none());
    }

    #[test]
    fn from_settings_converts_millis() {
        let settings = TransportSettings {
            reconnect_delay_ms: 250,
            heartbeat_incoming_ms: 0,
            max_reconnect_attempts: Some(4),
            ..TransportSettings::default()
        };
        let config = TransportConfig::from_settings(&settings);
        assert_eq!(config.reconnect_delay, Duration::from_millis(250));
        assert_eq!(config.heartbeat.incoming, Duration::ZERO);
        assert_eq!(config.max_reconnect_attempts, Some(4));
    }

    #[test]
    fn builders_override() {
        let config = TransportConfig::default()
            .with_url("ws://broker/ws")
            .with_reconnect_delay(Duration::from_millis(50))
            .with_heartbeat(HeartbeatConfig::DISABLED);
        assert_eq!(config.url, "ws://broker/ws");
        assert_eq!(config.reconnect_delay, Duration::from_millis(50));
        assert_eq!(config.heartbeat, HeartbeatConfig::DISABLED);
    }
}
