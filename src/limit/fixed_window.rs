//! Fixed window rate limiter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::lease::Lease;
use super::queue::{Enqueue, WaitQueue};
use crate::clock::{self, Instant};
use crate::config::{FixedWindowConfig, QueueConfig};
use crate::error::Result;

struct WindowState {
    count: u64,
    window_start: Instant,
    queue: WaitQueue,
}

/// A counter reset on fixed window boundaries.
///
/// Admits up to `permit_limit` requests per window; when the window
/// elapses the count resets to zero and a fresh window begins at the
/// boundary, not retroactively prorated. A burst just before a boundary
/// and another just after can both succeed, up to `2 x permit_limit`
/// admissions in a short span. That is an accepted property of fixed
/// windows, preserved here.
pub struct FixedWindowLimiter {
    permit_limit: u64,
    window: Duration,
    auto_replenishment: bool,
    state: Mutex<WindowState>,
    total_granted: AtomicU64,
    total_denied: AtomicU64,
}

impl FixedWindowLimiter {
    /// Create a limiter from validated configuration.
    pub fn new(config: &FixedWindowConfig, queue: &QueueConfig) -> Result<Self> {
        Self::new_at(config, queue, clock::now())
    }

    /// Create a limiter whose first window starts at an explicit instant.
    pub fn new_at(config: &FixedWindowConfig, queue: &QueueConfig, now: Instant) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            permit_limit: config.permit_limit,
            window: config.window(),
            auto_replenishment: config.auto_replenishment,
            state: Mutex::new(WindowState {
                count: 0,
                window_start: now,
                queue: WaitQueue::new(queue.limit, queue.order),
            }),
            total_granted: AtomicU64::new(0),
            total_denied: AtomicU64::new(0),
        })
    }

    /// Attempt to claim one permit in the current window without waiting.
    pub fn try_acquire(&self) -> Lease {
        self.try_acquire_at(clock::now())
    }

    /// Attempt to claim one permit at an explicit instant.
    pub fn try_acquire_at(&self, now: Instant) -> Lease {
        let mut state = self.state.lock();
        self.roll(&mut state, now);
        if state.count < self.permit_limit {
            state.count += 1;
            self.total_granted.fetch_add(1, Ordering::Relaxed);
            Lease::granted()
        } else {
            self.total_denied.fetch_add(1, Ordering::Relaxed);
            debug!("fixed window exhausted");
            Lease::denied(Some(self.until_reset(&state, now)))
        }
    }

    /// Claim one permit, waiting in the policy queue until the window
    /// resets if the current one is exhausted.
    pub async fn acquire(&self) -> Lease {
        let rx = {
            let now = clock::now();
            let mut state = self.state.lock();
            self.roll(&mut state, now);
            if state.count < self.permit_limit {
                state.count += 1;
                self.total_granted.fetch_add(1, Ordering::Relaxed);
                return Lease::granted();
            }
            match state.queue.push() {
                Enqueue::Queued(rx) => rx,
                Enqueue::Rejected => {
                    self.total_denied.fetch_add(1, Ordering::Relaxed);
                    return Lease::denied(Some(self.until_reset(&state, now)));
                }
            }
        };

        let lease = rx.await.unwrap_or_else(|_| Lease::denied(None));
        if lease.is_granted() {
            self.total_granted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_denied.fetch_add(1, Ordering::Relaxed);
        }
        lease
    }

    /// Roll the window forward at an explicit instant, waking queued
    /// callers freed by the reset. The background timer calls this on the
    /// window period when auto replenishment is on.
    pub fn advance_at(&self, now: Instant) {
        let mut state = self.state.lock();
        self.roll(&mut state, now);
    }

    /// Permits still available in the current window.
    pub fn available(&self) -> u64 {
        let state = self.state.lock();
        self.permit_limit.saturating_sub(state.count)
    }

    pub(crate) fn auto_replenishment_period(&self) -> Option<Duration> {
        self.auto_replenishment.then_some(self.window)
    }

    pub(crate) fn queued_len(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub(crate) fn decision_totals(&self) -> (u64, u64) {
        (
            self.total_granted.load(Ordering::Relaxed),
            self.total_denied.load(Ordering::Relaxed),
        )
    }

    /// Reset the window if it has expired; queued waiters claim the fresh
    /// capacity before the caller does, preserving arrival order.
    fn roll(&self, state: &mut WindowState, now: Instant) {
        if now.saturating_duration_since(state.window_start) >= self.window {
            state.count = 0;
            state.window_start = now;
            trace!("window reset");
            self.wake_waiters(state);
        }
    }

    fn wake_waiters(&self, state: &mut WindowState) {
        if state.queue.is_empty() {
            return;
        }
        while state.count < self.permit_limit {
            let Some(tx) = state.queue.pop() else { break };
            state.count += 1;
            if tx.send(Lease::granted()).is_err() {
                // Waiter cancelled; the permit goes back to the window
                state.count -= 1;
            }
        }
    }

    fn until_reset(&self, state: &WindowState, now: Instant) -> Duration {
        (state.window_start + self.window).saturating_duration_since(now)
    }
}

impl std::fmt::Debug for FixedWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedWindowLimiter")
            .field("permit_limit", &self.permit_limit)
            .field("window", &self.window)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueOrder;
    use std::sync::Arc;

    fn window_at(permit_limit: u64, window_ms: u64, at: Instant) -> FixedWindowLimiter {
        FixedWindowLimiter::new_at(
            &FixedWindowConfig {
                permit_limit,
                window_ms,
                auto_replenishment: false,
            },
            &QueueConfig::default(),
            at,
        )
        .unwrap()
    }

    #[test]
    fn test_exactly_permit_limit_per_window() {
        let start = clock::now();
        let limiter = window_at(10, 10_000, start);

        for _ in 0..10 {
            assert!(limiter.try_acquire_at(start).is_granted());
        }
        assert!(!limiter.try_acquire_at(start).is_granted());

        // After the window elapses the counter resets in full
        let later = start + Duration::from_secs(10);
        for _ in 0..10 {
            assert!(limiter.try_acquire_at(later).is_granted());
        }
        assert!(!limiter.try_acquire_at(later).is_granted());
    }

    #[test]
    fn test_denial_reports_time_to_reset() {
        let start = clock::now();
        let limiter = window_at(1, 10_000, start);
        assert!(limiter.try_acquire_at(start).is_granted());

        let lease = limiter.try_acquire_at(start + Duration::from_secs(4));
        assert!(!lease.is_granted());
        assert_eq!(lease.retry_after(), Some(Duration::from_secs(6)));
    }

    #[test]
    fn test_boundary_double_burst_is_preserved() {
        let start = clock::now();
        let limiter = window_at(10, 10_000, start);

        // Full burst just before the boundary...
        let before = start + Duration::from_millis(9_900);
        let mut admitted = 0;
        for _ in 0..10 {
            if limiter.try_acquire_at(before).is_granted() {
                admitted += 1;
            }
        }
        // ...and another full burst just after: both succeed
        let after = start + Duration::from_millis(10_100);
        for _ in 0..10 {
            if limiter.try_acquire_at(after).is_granted() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 20);
    }

    #[test]
    fn test_fresh_window_starts_at_observation() {
        let start = clock::now();
        let limiter = window_at(2, 1_000, start);
        assert!(limiter.try_acquire_at(start).is_granted());

        // Reset observed at start+2.5s; the new window runs from there
        let observed = start + Duration::from_millis(2_500);
        assert!(limiter.try_acquire_at(observed).is_granted());
        assert!(limiter.try_acquire_at(observed).is_granted());
        let lease = limiter.try_acquire_at(observed + Duration::from_millis(400));
        assert!(!lease.is_granted());
        assert_eq!(lease.retry_after(), Some(Duration::from_millis(600)));
    }

    #[test]
    fn test_backward_clock_does_not_reset() {
        let start = clock::now();
        let limiter = window_at(1, 1_000, start);
        assert!(limiter.try_acquire_at(start + Duration::from_secs(5)).is_granted());

        // An earlier instant must not re-open the window
        assert!(!limiter.try_acquire_at(start).is_granted());
    }

    #[test]
    fn test_last_permit_has_one_winner() {
        use std::thread;

        let limiter = Arc::new(window_at(1, 10_000, clock::now()));
        let mut handles = vec![];
        for _ in 0..8 {
            let limiter = limiter.clone();
            handles.push(thread::spawn(move || {
                u64::from(limiter.try_acquire().is_granted())
            }));
        }
        let granted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 1);
    }

    #[tokio::test]
    async fn test_window_reset_wakes_queued_waiters_fifo() {
        let limiter = Arc::new(
            FixedWindowLimiter::new(
                &FixedWindowConfig {
                    permit_limit: 1,
                    window_ms: 1_000,
                    auto_replenishment: false,
                },
                &QueueConfig {
                    limit: 1,
                    order: QueueOrder::OldestFirst,
                },
            )
            .unwrap(),
        );
        assert!(limiter.acquire().await.is_granted());

        let mut waiter = tokio_test::task::spawn({
            let limiter = limiter.clone();
            async move { limiter.acquire().await }
        });
        assert!(waiter.poll().is_pending());

        // Queue is full beyond its limit: overflow denies immediately
        let overflow = limiter.acquire().await;
        assert!(!overflow.is_granted());

        limiter.advance_at(clock::now() + Duration::from_secs(1));
        match waiter.poll() {
            std::task::Poll::Ready(lease) => assert!(lease.is_granted()),
            std::task::Poll::Pending => panic!("waiter should be woken at the boundary"),
        }
        // The woken waiter claimed the fresh window's only permit
        assert_eq!(limiter.available(), 0);
    }
}
