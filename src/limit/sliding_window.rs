//! Sliding window rate limiter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::lease::Lease;
use super::queue::{Enqueue, WaitQueue};
use crate::clock::{self, Instant};
use crate::config::{QueueConfig, SlidingWindowConfig};
use crate::error::Result;

struct SegmentState {
    /// Ring of per-segment counters; `current` is the slot being filled
    segments: Vec<u64>,
    current: usize,
    segment_start: Instant,
    /// Sum of all live segments, kept in step with the ring
    total: u64,
    queue: WaitQueue,
}

/// A segmented counter approximating a continuous trailing window.
///
/// The window is divided into `segments_per_window` equal segments. Each
/// grant increments the current segment; the effective count is the sum
/// over the current segment and the previous `segments_per_window - 1`.
/// On each segment boundary the ring rotates: the oldest slot's count is
/// subtracted from the running total and the slot is reused. A grant
/// therefore stops counting exactly one window after its segment began,
/// which smooths the boundary behavior and avoids the fixed window's
/// double-burst artifact.
pub struct SlidingWindowLimiter {
    permit_limit: u64,
    segment_len: Duration,
    auto_replenishment: bool,
    state: Mutex<SegmentState>,
    total_granted: AtomicU64,
    total_denied: AtomicU64,
}

impl SlidingWindowLimiter {
    /// Create a limiter from validated configuration.
    pub fn new(config: &SlidingWindowConfig, queue: &QueueConfig) -> Result<Self> {
        Self::new_at(config, queue, clock::now())
    }

    /// Create a limiter whose first segment starts at an explicit instant.
    pub fn new_at(config: &SlidingWindowConfig, queue: &QueueConfig, now: Instant) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            permit_limit: config.permit_limit,
            segment_len: config.segment_length(),
            auto_replenishment: config.auto_replenishment,
            state: Mutex::new(SegmentState {
                segments: vec![0; config.segments_per_window as usize],
                current: 0,
                segment_start: now,
                total: 0,
                queue: WaitQueue::new(queue.limit, queue.order),
            }),
            total_granted: AtomicU64::new(0),
            total_denied: AtomicU64::new(0),
        })
    }

    /// Attempt to claim one permit against the trailing window without
    /// waiting.
    pub fn try_acquire(&self) -> Lease {
        self.try_acquire_at(clock::now())
    }

    /// Attempt to claim one permit at an explicit instant.
    pub fn try_acquire_at(&self, now: Instant) -> Lease {
        let mut state = self.state.lock();
        self.roll(&mut state, now);
        if state.total < self.permit_limit {
            let current = state.current;
            state.segments[current] += 1;
            state.total += 1;
            self.total_granted.fetch_add(1, Ordering::Relaxed);
            Lease::granted()
        } else {
            self.total_denied.fetch_add(1, Ordering::Relaxed);
            debug!("sliding window exhausted");
            Lease::denied(Some(self.until_next_segment(&state, now)))
        }
    }

    /// Claim one permit, waiting in the policy queue until enough of the
    /// window rolls off if it is currently exhausted.
    pub async fn acquire(&self) -> Lease {
        let rx = {
            let now = clock::now();
            let mut state = self.state.lock();
            self.roll(&mut state, now);
            if state.total < self.permit_limit {
                let current = state.current;
                state.segments[current] += 1;
                state.total += 1;
                self.total_granted.fetch_add(1, Ordering::Relaxed);
                return Lease::granted();
            }
            match state.queue.push() {
                Enqueue::Queued(rx) => rx,
                Enqueue::Rejected => {
                    self.total_denied.fetch_add(1, Ordering::Relaxed);
                    return Lease::denied(Some(self.until_next_segment(&state, now)));
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

    /// Roll segments forward at an explicit instant, waking queued callers
    /// freed by evicted segments. The background timer calls this on the
    /// segment length when auto replenishment is on.
    pub fn advance_at(&self, now: Instant) {
        let mut state = self.state.lock();
        self.roll(&mut state, now);
    }

    /// The effective count over the trailing window at an explicit instant.
    pub fn effective_count_at(&self, now: Instant) -> u64 {
        let mut state = self.state.lock();
        self.roll(&mut state, now);
        state.total
    }

    /// Permits still available in the trailing window.
    pub fn available(&self) -> u64 {
        let state = self.state.lock();
        self.permit_limit.saturating_sub(state.total)
    }

    pub(crate) fn auto_replenishment_period(&self) -> Option<Duration> {
        self.auto_replenishment.then_some(self.segment_len)
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

    /// Rotate the ring one slot per elapsed segment length, evicting the
    /// oldest segment's contribution each step. A long stall clears the
    /// whole ring in one pass instead of stepping through every missed
    /// boundary.
    fn roll(&self, state: &mut SegmentState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.segment_start);
        let steps = (elapsed.as_nanos() / self.segment_len.as_nanos()) as u64;
        if steps == 0 {
            return;
        }

        let len = state.segments.len();
        if steps >= len as u64 {
            state.segments.iter_mut().for_each(|slot| *slot = 0);
            state.total = 0;
            state.current = (state.current + (steps % len as u64) as usize) % len;
        } else {
            for _ in 0..steps {
                state.current = (state.current + 1) % len;
                let evicted = state.segments[state.current];
                state.total = state.total.saturating_sub(evicted);
                state.segments[state.current] = 0;
            }
        }

        // Advance by whole segments so boundaries stay exact
        let phase = Duration::from_nanos((elapsed.as_nanos() % self.segment_len.as_nanos()) as u64);
        state.segment_start = now - phase;

        trace!(total = state.total, "segments rolled");
        self.wake_waiters(state);
    }

    fn wake_waiters(&self, state: &mut SegmentState) {
        if state.queue.is_empty() {
            return;
        }
        while state.total < self.permit_limit {
            let Some(tx) = state.queue.pop() else { break };
            let current = state.current;
            state.segments[current] += 1;
            state.total += 1;
            if tx.send(Lease::granted()).is_err() {
                // Waiter cancelled; take its claim back out of the window
                state.segments[current] -= 1;
                state.total -= 1;
            }
        }
    }

    fn until_next_segment(&self, state: &SegmentState, now: Instant) -> Duration {
        (state.segment_start + self.segment_len).saturating_duration_since(now)
    }
}

impl std::fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("permit_limit", &self.permit_limit)
            .field("segment_len", &self.segment_len)
            .field("available", &self.available())
            .finish()
    }
}
