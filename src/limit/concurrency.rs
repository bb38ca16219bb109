//! Concurrency (in-flight) limiter.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use super::lease::Lease;
use super::queue::{Enqueue, WaitQueue};
use crate::config::{ConcurrencyConfig, QueueConfig};
use crate::error::Result;

struct SlotState {
    in_flight: u64,
    queue: WaitQueue,
}

/// Shared slot accounting, kept alive by the limiter and by every
/// outstanding permit.
struct Slots {
    permit_limit: u64,
    state: Mutex<SlotState>,
}

impl Slots {
    /// Return one slot: hand it to a queued waiter if any, otherwise
    /// decrement the in-flight count.
    fn release_one(slots: &Arc<Self>) {
        let mut state = slots.state.lock();
        loop {
            match state.queue.pop() {
                Some(tx) => {
                    // The slot transfers to the waiter; in_flight is unchanged
                    let lease = Lease::with_permit(Permit::new(slots.clone()));
                    match tx.send(lease) {
                        Ok(()) => return,
                        Err(lease) => {
                            // Waiter cancelled. Disarm before the returned
                            // lease drops: its permit would otherwise
                            // re-enter this lock.
                            lease.disarm();
                        }
                    }
                }
                None => {
                    state.in_flight = state.in_flight.saturating_sub(1);
                    return;
                }
            }
        }
    }
}

/// A handle to one unit of in-flight capacity.
///
/// Releases its slot exactly once: explicitly via [`Lease::release`] or
/// implicitly on drop, whichever comes first.
pub(crate) struct Permit {
    slots: Arc<Slots>,
    released: AtomicBool,
}

impl Permit {
    fn new(slots: Arc<Slots>) -> Self {
        Self {
            slots,
            released: AtomicBool::new(false),
        }
    }

    pub(crate) fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            Slots::release_one(&self.slots);
        }
    }

    pub(crate) fn disarm(&self) {
        self.released.store(true, Ordering::Release);
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Permit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Permit")
            .field("released", &self.released.load(Ordering::Relaxed))
            .finish()
    }
}

/// A semaphore-style in-flight counter.
///
/// Unlike the window and bucket algorithms, capacity here is returned by
/// callers: a granted lease owns a permit that must live for the request
/// and releases its slot on drop. Denials carry no retry hint, since
/// admission depends on other callers finishing rather than on the clock.
pub struct ConcurrencyLimiter {
    slots: Arc<Slots>,
    total_granted: AtomicU64,
    total_denied: AtomicU64,
}

impl ConcurrencyLimiter {
    /// Create a limiter from validated configuration.
    pub fn new(config: &ConcurrencyConfig, queue: &QueueConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            slots: Arc::new(Slots {
                permit_limit: config.permit_limit,
                state: Mutex::new(SlotState {
                    in_flight: 0,
                    queue: WaitQueue::new(queue.limit, queue.order),
                }),
            }),
            total_granted: AtomicU64::new(0),
            total_denied: AtomicU64::new(0),
        })
    }

    /// Attempt to claim an in-flight slot without waiting.
    pub fn try_acquire(&self) -> Lease {
        let lease = {
            let mut state = self.slots.state.lock();
            if state.in_flight < self.slots.permit_limit {
                state.in_flight += 1;
                Some(Lease::with_permit(Permit::new(self.slots.clone())))
            } else {
                None
            }
        };
        match lease {
            Some(lease) => {
                self.total_granted.fetch_add(1, Ordering::Relaxed);
                lease
            }
            None => {
                self.total_denied.fetch_add(1, Ordering::Relaxed);
                debug!("concurrency limit reached");
                Lease::denied(None)
            }
        }
    }

    /// Claim an in-flight slot, waiting in the policy queue until another
    /// caller releases one.
    pub async fn acquire(&self) -> Lease {
        let rx = {
            let mut state = self.slots.state.lock();
            if state.in_flight < self.slots.permit_limit {
                state.in_flight += 1;
                drop(state);
                self.total_granted.fetch_add(1, Ordering::Relaxed);
                return Lease::with_permit(Permit::new(self.slots.clone()));
            }
            match state.queue.push() {
                Enqueue::Queued(rx) => rx,
                Enqueue::Rejected => {
                    drop(state);
                    self.total_denied.fetch_add(1, Ordering::Relaxed);
                    return Lease::denied(None);
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

    /// The number of slots currently free.
    pub fn available(&self) -> u64 {
        let state = self.slots.state.lock();
        self.slots.permit_limit.saturating_sub(state.in_flight)
    }

    /// The number of requests currently holding a slot.
    pub fn in_flight(&self) -> u64 {
        self.slots.state.lock().in_flight
    }

    pub(crate) fn queued_len(&self) -> usize {
        self.slots.state.lock().queue.len()
    }

    pub(crate) fn decision_totals(&self) -> (u64, u64) {
        (
            self.total_granted.load(Ordering::Relaxed),
            self.total_denied.load(Ordering::Relaxed),
        )
    }
}

impl std::fmt::Debug for ConcurrencyLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrencyLimiter")
            .field("permit_limit", &self.slots.permit_limit)
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
