//! Monotonic time source and replenishment scheduling.
//!
//! All limiter timing is based on [`tokio::time::Instant`], which is
//! monotonic (and controllable under tokio's paused test clock). Elapsed
//! time is computed with saturating arithmetic throughout the crate, so an
//! instant from the past can never drive a counter negative.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::trace;

pub use tokio::time::Instant;

use crate::limit::Limiter;

/// The current instant from the monotonic clock.
pub fn now() -> Instant {
    Instant::now()
}

/// A cancellable periodic task that drives a limiter's replenishment.
///
/// Started when an auto-replenishing policy is registered, stopped (by
/// abort) when the ticker is dropped, at registry shutdown or teardown.
/// Holds only a weak reference so a ticker can never keep its limiter
/// alive.
pub(crate) struct Ticker {
    handle: JoinHandle<()>,
}

impl Ticker {
    /// Spawn the background tick loop. Must be called from within a tokio
    /// runtime.
    pub(crate) fn spawn(period: Duration, limiter: Weak<dyn Limiter>) -> Self {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // Missed periods are caught up inside the limiter from elapsed
            // time; firing a burst of stale ticks here would double-apply
            // that correction.
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; the loop below only
            // sees full periods.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(limiter) = limiter.upgrade() else { break };
                limiter.tick(now());
                trace!("replenishment tick");
            }
        });
        Self { handle }
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
