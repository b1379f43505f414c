//! Runtime counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Shared counters, updated lock-free from the driver and the publish path.
#[derive(Debug, Default)]
pub struct TransportStats {
    connections_opened: AtomicU64,
    reconnect_attempts: AtomicU64,
    frames_dispatched: AtomicU64,
    frames_dropped: AtomicU64,
    handler_panics: AtomicU64,
    messages_sent: AtomicU64,
}

/// Point-in-time copy of [`TransportStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    /// Handshakes that reached `CONNECTED`.
    pub connections_opened: u64,
    /// Retries scheduled after a failure.
    pub reconnect_attempts: u64,
    /// Inbound envelopes fanned out to handlers.
    pub frames_dispatched: u64,
    /// Inbound frames discarded as undecodable or oversized.
    pub frames_dropped: u64,
    /// Handler invocations that panicked.
    pub handler_panics: u64,
    /// Envelopes handed to the link by `send`.
    pub messages_sent: u64,
}

impl TransportStats {
    pub(crate) fn connection_opened(&self) {
        let _ = self.connections_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reconnect_attempt(&self) {
        let _ = self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_dispatched(&self) {
        let _ = self.frames_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn frame_dropped(&self) {
        let _ = self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handler_panicked(&self) {
        let _ = self.handler_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn message_sent(&self) {
        let _ = self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Read every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            reconnect_attempts: self.reconnect_attempts.load(Ordering::Relaxed),
            frames_dispatched: self.frames_dispatched.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            handler_panics: self.handler_panics.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
        }
    }
}
