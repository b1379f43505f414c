//! Incoming liveness monitoring.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;

/// Set whenever anything arrives from the broker.
#[derive(Debug)]
pub struct Liveness {
    alive: AtomicBool,
}

impl Default for Liveness {
    fn default() -> Self {
        Self {
            alive: AtomicBool::new(true),
        }
    }
}

impl Liveness {
    /// Fresh tracker, counted as alive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record activity.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
    }

    /// Whether there was activity since the last check; resets the flag.
    pub fn check_alive(&self) -> bool {
        self.alive.swap(false, Ordering::Relaxed)
    }
}

/// Outcome of [`run_heartbeat`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatResult {
    /// Nothing arrived for `max_missed` consecutive intervals.
    TimedOut,
    /// Stopped externally.
    Cancelled,
}

/// Check `liveness` every `interval` until `max_missed` consecutive checks
/// find no activity.
pub async fn run_heartbeat(
    liveness: Arc<Liveness>,
    interval: Duration,
    max_missed: u32,
    cancel: CancellationToken,
) -> HeartbeatResult {
    let mut check = time::interval(interval);
    check.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    let max_missed = max_missed.max(1);
    let mut missed: u32 = 0;

    loop {
        tokio::select! {
            _ = check.tick() => {
                if liveness.check_alive() {
                    missed = 0;
                } else {
                    missed += 1;
                    if missed >= max_missed {
                        return HeartbeatResult::TimedOut;
                    }
                }
            }
            () = cancel.cancelled() => return HeartbeatResult::Cancelled,
        }
    }
}
