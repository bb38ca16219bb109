//! Rate limiting algorithms and the admission decision interface.

mod concurrency;
mod fixed_window;
mod lease;
mod queue;
mod sliding_window;
mod token_bucket;

pub use concurrency::ConcurrencyLimiter;
pub use fixed_window::FixedWindowLimiter;
pub use lease::Lease;
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;

use std::time::Duration;

use async_trait::async_trait;

use crate::clock::Instant;

/// The decision interface shared by all limiter algorithms.
///
/// This trait abstracts the four disciplines so the [`Registry`] can route
/// decisions without knowing which algorithm backs a policy. The algorithm
/// is selected once at construction; there is no runtime switching.
///
/// [`Registry`]: crate::registry::Registry
#[async_trait]
pub trait Limiter: Send + Sync {
    /// Make an immediate admission decision; never waits.
    ///
    /// "No capacity" is an ordinary denied [`Lease`], not an error.
    fn try_acquire(&self) -> Lease;

    /// Make an admission decision, waiting in the policy's queue for
    /// capacity when one is configured.
    async fn acquire(&self) -> Lease;

    /// Apply one replenishment pass at `now`: restore tokens, reset an
    /// expired window, or roll segments, and wake queued callers. A no-op
    /// for algorithms whose capacity is returned by callers.
    fn tick(&self, now: Instant);

    /// The period the background timer should call [`tick`] on, or `None`
    /// when replenishment is external or unnecessary.
    ///
    /// [`tick`]: Limiter::tick
    fn replenishment_period(&self) -> Option<Duration>;

    /// A snapshot of this limiter's decision counters.
    fn metrics(&self) -> LimiterMetrics;
}

/// Decision counters for a single limiter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LimiterMetrics {
    /// Requests admitted since construction
    pub total_granted: u64,
    /// Requests denied since construction, including queue evictions
    pub total_denied: u64,
    /// Capacity currently available (tokens, window permits, or free slots)
    pub available: u64,
    /// Callers currently parked in the wait queue
    pub queued: u64,
}

#[async_trait]
impl Limiter for TokenBucketLimiter {
    fn try_acquire(&self) -> Lease {
        TokenBucketLimiter::try_acquire(self)
    }

    async fn acquire(&self) -> Lease {
        TokenBucketLimiter::acquire(self).await
    }

    fn tick(&self, now: Instant) {
        self.replenish_at(now);
    }

    fn replenishment_period(&self) -> Option<Duration> {
        self.auto_replenishment_period()
    }

    fn metrics(&self) -> LimiterMetrics {
        let (total_granted, total_denied) = self.decision_totals();
        LimiterMetrics {
            total_granted,
            total_denied,
            available: self.available(),
            queued: self.queued_len() as u64,
        }
    }
}

#[async_trait]
impl Limiter for FixedWindowLimiter {
    fn try_acquire(&self) -> Lease {
        FixedWindowLimiter::try_acquire(self)
    }

    async fn acquire(&self) -> Lease {
        FixedWindowLimiter::acquire(self).await
    }

    fn tick(&self, now: Instant) {
        self.advance_at(now);
    }

    fn replenishment_period(&self) -> Option<Duration> {
        self.auto_replenishment_period()
    }

    fn metrics(&self) -> LimiterMetrics {
        let (total_granted, total_denied) = self.decision_totals();
        LimiterMetrics {
            total_granted,
            total_denied,
            available: self.available(),
            queued: self.queued_len() as u64,
        }
    }
}

#[async_trait]
impl Limiter for SlidingWindowLimiter {
    fn try_acquire(&self) -> Lease {
        SlidingWindowLimiter::try_acquire(self)
    }

    async fn acquire(&self) -> Lease {
        SlidingWindowLimiter::acquire(self).await
    }

    fn tick(&self, now: Instant) {
        self.advance_at(now);
    }

    fn replenishment_period(&self) -> Option<Duration> {
        self.auto_replenishment_period()
    }

    fn metrics(&self) -> LimiterMetrics {
        let (total_granted, total_denied) = self.decision_totals();
        LimiterMetrics {
            total_granted,
            total_denied,
            available: self.available(),
            queued: self.queued_len() as u64,
        }
    }
}

#[async_trait]
impl Limiter for ConcurrencyLimiter {
    fn try_acquire(&self) -> Lease {
        ConcurrencyLimiter::try_acquire(self)
    }

    async fn acquire(&self) -> Lease {
        ConcurrencyLimiter::acquire(self).await
    }

    fn tick(&self, _now: Instant) {
        // In-flight capacity comes back when callers release, not on a clock
    }

    fn replenishment_period(&self) -> Option<Duration> {
        None
    }

    fn metrics(&self) -> LimiterMetrics {
        let (total_granted, total_denied) = self.decision_totals();
        LimiterMetrics {
            total_granted,
            total_denied,
            available: self.available(),
            queued: self.queued_len() as u64,
        }
    }
}
