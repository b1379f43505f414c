//! Outbound messages.

use std::sync::Arc;

use courier_core::{CourierError, MessageEnvelope, Result};
use tracing::debug;

use crate::protocol;
use crate::stats::TransportStats;
use crate::supervisor::ConnectionSupervisor;

/// Validates envelopes and writes them to the shared connection.
#[derive(Clone, Debug)]
pub struct PublishPath {
    supervisor: Arc<ConnectionSupervisor>,
    stats: Arc<TransportStats>,
}

impl PublishPath {
    /// Publish path over `supervisor`'s connection.
    pub fn new(supervisor: Arc<ConnectionSupervisor>, stats: Arc<TransportStats>) -> Self {
        Self { supervisor, stats }
    }

    /// Send `envelope` to the configured send destination.
    ///
    /// Nothing is written unless the envelope is valid and the connection is
    /// `Connected`. Messages are never queued for a later connection.
    ///
    /// # Errors
    ///
    /// `Validation` naming the first missing field, `NotConnected` when there
    /// is no live connection (or it closed while the frame was queued),
    /// `Encode` if the envelope cannot be serialized.
    pub async fn send(&self, envelope: &MessageEnvelope) -> Result<()> {
        envelope.validate()?;
        let outbound = self
            .supervisor
            .connected_outbound()
            .ok_or(CourierError::NotConnected)?;

        let body = envelope.to_json()?;
        let destination = &self.supervisor.config().send_destination;
        let frame = protocol::send_frame(destination, &body);
        outbound
            .send(frame.encode())
            .await
            .map_err(|_| CourierError::NotConnected)?;

        self.stats.message_sent();
        debug!(
            sender_id = %envelope.sender_id,
            recipient_id = %envelope.recipient_id,
            destination = %destination,
            "message sent"
        );
        Ok(())
    }
}
