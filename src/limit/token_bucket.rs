//! Token bucket rate limiter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::lease::Lease;
use super::queue::{Enqueue, WaitQueue};
use crate::clock::{self, Instant};
use crate::config::{QueueConfig, TokenBucketConfig};
use crate::error::{Result, TurnstileError};

struct BucketState {
    tokens: u64,
    last_replenish: Instant,
    queue: WaitQueue,
}

/// A replenishing token counter.
///
/// Each grant consumes one token; a periodic tick restores
/// `tokens_per_period` tokens up to `token_limit`. With auto replenishment
/// the tick is driven by a background timer owned by the [`Registry`];
/// otherwise the embedder calls [`replenish`] itself. Tokens are never
/// restored on the acquire path.
///
/// [`Registry`]: crate::registry::Registry
/// [`replenish`]: TokenBucketLimiter::replenish
pub struct TokenBucketLimiter {
    token_limit: u64,
    tokens_per_period: u64,
    period: Duration,
    auto_replenishment: bool,
    state: Mutex<BucketState>,
    total_granted: AtomicU64,
    total_denied: AtomicU64,
}

impl TokenBucketLimiter {
    /// Create a limiter from validated configuration.
    ///
    /// The bucket starts full.
    pub fn new(config: &TokenBucketConfig, queue: &QueueConfig) -> Result<Self> {
        Self::new_at(config, queue, clock::now())
    }

    /// Create a limiter whose replenishment phase starts at an explicit
    /// instant. Useful for embedders that drive time themselves through
    /// the `*_at` entry points.
    pub fn new_at(config: &TokenBucketConfig, queue: &QueueConfig, now: Instant) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            token_limit: config.token_limit,
            tokens_per_period: config.tokens_per_period,
            period: config.replenishment_period(),
            auto_replenishment: config.auto_replenishment,
            state: Mutex::new(BucketState {
                tokens: config.token_limit,
                last_replenish: now,
                queue: WaitQueue::new(queue.limit, queue.order),
            }),
            total_granted: AtomicU64::new(0),
            total_denied: AtomicU64::new(0),
        })
    }

    /// Attempt to consume one token without waiting.
    pub fn try_acquire(&self) -> Lease {
        self.try_acquire_at(clock::now())
    }

    /// Attempt to consume one token at an explicit instant.
    pub fn try_acquire_at(&self, now: Instant) -> Lease {
        let mut state = self.state.lock();
        if state.tokens > 0 {
            state.tokens -= 1;
            self.total_granted.fetch_add(1, Ordering::Relaxed);
            Lease::granted()
        } else {
            self.total_denied.fetch_add(1, Ordering::Relaxed);
            debug!("token bucket exhausted");
            Lease::denied(Some(self.next_tick_in(&state, now)))
        }
    }

    /// Attempt to consume `cost` tokens atomically: all or none.
    ///
    /// A cost above `token_limit` could never succeed and is reported as a
    /// configuration error rather than a perpetual denial. A cost of zero
    /// always succeeds.
    pub fn try_acquire_n(&self, cost: u64) -> Result<Lease> {
        self.try_acquire_n_at(cost, clock::now())
    }

    /// Attempt to consume `cost` tokens at an explicit instant.
    pub fn try_acquire_n_at(&self, cost: u64, now: Instant) -> Result<Lease> {
        if cost > self.token_limit {
            return Err(TurnstileError::Config(format!(
                "cost {} exceeds token_limit {}",
                cost, self.token_limit
            )));
        }
        if cost == 0 {
            return Ok(Lease::granted());
        }

        let mut state = self.state.lock();
        if state.tokens >= cost {
            state.tokens -= cost;
            self.total_granted.fetch_add(1, Ordering::Relaxed);
            Ok(Lease::granted())
        } else {
            self.total_denied.fetch_add(1, Ordering::Relaxed);
            Ok(Lease::denied(Some(self.next_tick_in(&state, now))))
        }
    }

    /// Consume one token, waiting in the policy queue if none are available.
    ///
    /// With a queue limit of zero this is equivalent to [`try_acquire`].
    ///
    /// [`try_acquire`]: TokenBucketLimiter::try_acquire
    pub async fn acquire(&self) -> Lease {
        let rx = {
            let now = clock::now();
            let mut state = self.state.lock();
            if state.tokens > 0 {
                state.tokens -= 1;
                self.total_granted.fetch_add(1, Ordering::Relaxed);
                return Lease::granted();
            }
            match state.queue.push() {
                Enqueue::Queued(rx) => rx,
                Enqueue::Rejected => {
                    self.total_denied.fetch_add(1, Ordering::Relaxed);
                    return Lease::denied(Some(self.next_tick_in(&state, now)));
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

    /// Apply one replenishment pass now.
    ///
    /// This is the explicit external tick for `auto_replenishment = false`
    /// configurations; with auto replenishment the background timer calls
    /// it on the configured period.
    pub fn replenish(&self) {
        self.replenish_at(clock::now());
    }

    /// Apply a replenishment pass at an explicit instant.
    ///
    /// Missed periods are caught up in one step: the number of whole
    /// periods elapsed since the last tick determines the tokens added,
    /// capped at `token_limit`. A clock that has not advanced (or appears
    /// to run backward) adds nothing.
    pub fn replenish_at(&self, now: Instant) {
        let mut state = self.state.lock();
        let elapsed = now.saturating_duration_since(state.last_replenish);
        let periods = (elapsed.as_nanos() / self.period.as_nanos()) as u64;
        if periods == 0 {
            return;
        }

        let added = self.tokens_per_period.saturating_mul(periods);
        state.tokens = state.tokens.saturating_add(added).min(self.token_limit);

        // Keep the tick phase aligned: advance by whole periods only
        let phase = Duration::from_nanos((elapsed.as_nanos() % self.period.as_nanos()) as u64);
        state.last_replenish = now - phase;

        trace!(periods, tokens = state.tokens, "replenished token bucket");
        self.wake_waiters(&mut state);
    }

    /// The number of tokens currently available.
    pub fn available(&self) -> u64 {
        self.state.lock().tokens
    }

    pub(crate) fn auto_replenishment_period(&self) -> Option<Duration> {
        self.auto_replenishment.then_some(self.period)
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

    /// Hand freed tokens to queued waiters, oldest (or newest) first.
    fn wake_waiters(&self, state: &mut BucketState) {
        if state.queue.is_empty() {
            return;
        }
        while state.tokens > 0 {
            let Some(tx) = state.queue.pop() else { break };
            state.tokens -= 1;
            if tx.send(Lease::granted()).is_err() {
                // Waiter cancelled; put the token back
                state.tokens += 1;
            }
        }
    }

    /// Time until the next replenishment tick, phase-aligned to the last one.
    fn next_tick_in(&self, state: &BucketState, now: Instant) -> Duration {
        let since = now.saturating_duration_since(state.last_replenish);
        let period = self.period.as_nanos();
        Duration::from_nanos((period - (since.as_nanos() % period)) as u64)
    }
}

impl std::fmt::Debug for TokenBucketLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucketLimiter")
            .field("token_limit", &self.token_limit)
            .field("tokens_per_period", &self.tokens_per_period)
            .field("period", &self.period)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueOrder;

    fn bucket_at(
        token_limit: u64,
        tokens_per_period: u64,
        period_ms: u64,
        at: Instant,
    ) -> TokenBucketLimiter {
        TokenBucketLimiter::new_at(
            &TokenBucketConfig {
                token_limit,
                tokens_per_period,
                replenishment_period_ms: period_ms,
                auto_replenishment: false,
            },
            &QueueConfig::default(),
            at,
        )
        .unwrap()
    }

    #[test]
    fn test_tokens_stay_within_bounds() {
        let start = clock::now();
        let limiter = bucket_at(10, 5, 1000, start);

        for _ in 0..10 {
            assert!(limiter.try_acquire_at(start).is_granted());
        }
        assert!(!limiter.try_acquire_at(start).is_granted());
        assert_eq!(limiter.available(), 0);

        // Replenishing far past the cap never overfills
        limiter.replenish_at(start + Duration::from_secs(100));
        assert_eq!(limiter.available(), 10);
    }

    #[test]
    fn test_denial_reports_time_to_next_tick() {
        let start = clock::now();
        let limiter = bucket_at(1, 1, 1000, start);
        assert!(limiter.try_acquire_at(start).is_granted());

        let lease = limiter.try_acquire_at(start + Duration::from_millis(400));
        assert!(!lease.is_granted());
        assert_eq!(lease.retry_after(), Some(Duration::from_millis(600)));
    }

    #[test]
    fn test_catch_up_caps_missed_periods() {
        let start = clock::now();
        let limiter = bucket_at(100, 5, 1000, start);
        for _ in 0..100 {
            assert!(limiter.try_acquire_at(start).is_granted());
        }

        // Three periods elapsed at once: exactly 3 x 5 tokens, no more
        limiter.replenish_at(start + Duration::from_millis(3500));
        assert_eq!(limiter.available(), 15);

        // The tick phase stays aligned: only half a period remains
        let lease = limiter.try_acquire_n_at(16, start + Duration::from_millis(3500)).unwrap();
        assert!(!lease.is_granted());
        assert_eq!(lease.retry_after(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_replenish_before_period_adds_nothing() {
        let start = clock::now();
        let limiter = bucket_at(2, 1, 1000, start);
        assert!(limiter.try_acquire_at(start).is_granted());
        assert!(limiter.try_acquire_at(start).is_granted());

        limiter.replenish_at(start + Duration::from_millis(999));
        assert_eq!(limiter.available(), 0);

        limiter.replenish_at(start + Duration::from_millis(1000));
        assert_eq!(limiter.available(), 1);
    }

    #[test]
    fn test_backward_clock_is_clamped() {
        let start = clock::now();
        let limiter = bucket_at(2, 1, 1000, start);
        assert!(limiter.try_acquire_at(start).is_granted());

        // Advance the tick phase, then hand in instants from the past:
        // counters must not move and nothing may underflow
        limiter.replenish_at(start + Duration::from_secs(10));
        assert_eq!(limiter.available(), 2);
        limiter.replenish_at(start);
        assert_eq!(limiter.available(), 2);
        assert!(limiter.try_acquire_at(start).is_granted());
    }

    #[test]
    fn test_bulk_acquire_is_all_or_none() {
        let start = clock::now();
        let limiter = bucket_at(10, 1, 1000, start);

        assert!(limiter.try_acquire_n_at(5, start).unwrap().is_granted());
        assert!(limiter.try_acquire_n_at(3, start).unwrap().is_granted());
        assert!(!limiter.try_acquire_n_at(5, start).unwrap().is_granted());
        assert_eq!(limiter.available(), 2);
        assert!(limiter.try_acquire_n_at(2, start).unwrap().is_granted());
    }

    #[test]
    fn test_cost_above_capacity_is_config_error() {
        let limiter = bucket_at(10, 1, 1000, clock::now());
        let err = limiter.try_acquire_n(11).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
    }

    #[test]
    fn test_zero_cost_always_succeeds() {
        let start = clock::now();
        let limiter = bucket_at(1, 1, 1000, start);
        assert!(limiter.try_acquire_at(start).is_granted());
        assert!(limiter.try_acquire_n_at(0, start).unwrap().is_granted());
    }

    #[test]
    fn test_invalid_config_fails_construction() {
        let result = TokenBucketLimiter::new(
            &TokenBucketConfig {
                token_limit: 10,
                tokens_per_period: 0,
                replenishment_period_ms: 1000,
                auto_replenishment: true,
            },
            &QueueConfig::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_concurrent_acquisition_grants_each_token_once() {
        use std::sync::Arc;
        use std::thread;

        let limiter = Arc::new(bucket_at(100, 1, 1000, clock::now()));
        let mut handles = vec![];
        for _ in 0..8 {
            let limiter = limiter.clone();
            handles.push(thread::spawn(move || {
                let mut granted = 0u64;
                for _ in 0..50 {
                    if limiter.try_acquire().is_granted() {
                        granted += 1;
                    }
                }
                granted
            }));
        }

        let granted: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 100);
        assert_eq!(limiter.available(), 0);
    }

    #[tokio::test]
    async fn test_replenish_wakes_queued_waiters() {
        use std::sync::Arc;

        let limiter = Arc::new(
            TokenBucketLimiter::new(
                &TokenBucketConfig {
                    token_limit: 2,
                    tokens_per_period: 2,
                    replenishment_period_ms: 1000,
                    auto_replenishment: false,
                },
                &QueueConfig {
                    limit: 2,
                    order: QueueOrder::OldestFirst,
                },
            )
            .unwrap(),
        );
        assert!(limiter.acquire().await.is_granted());
        assert!(limiter.acquire().await.is_granted());

        let mut first = tokio_test::task::spawn({
            let limiter = limiter.clone();
            async move { limiter.acquire().await }
        });
        let mut second = tokio_test::task::spawn({
            let limiter = limiter.clone();
            async move { limiter.acquire().await }
        });
        assert!(first.poll().is_pending());
        assert!(second.poll().is_pending());

        // One period restores two tokens; both waiters are granted
        limiter.replenish_at(clock::now() + Duration::from_secs(1));
        match first.poll() {
            std::task::Poll::Ready(lease) => assert!(lease.is_granted()),
            std::task::Poll::Pending => panic!("first waiter should be woken"),
        }
        match second.poll() {
            std::task::Poll::Ready(lease) => assert!(lease.is_granted()),
            std::task::Poll::Pending => panic!("second waiter should be woken"),
        }
        assert_eq!(limiter.available(), 0);
    }
}
