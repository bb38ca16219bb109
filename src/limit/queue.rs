//! FIFO wait list for callers queued behind exhausted capacity.

use std::collections::VecDeque;
use tokio::sync::oneshot;
use tracing::trace;

use super::lease::Lease;
use crate::config::QueueOrder;

/// Result of attempting to enqueue a caller.
pub(crate) enum Enqueue {
    /// The caller was parked; the receiver resolves when the limiter hands
    /// it a lease (granted on wake, denied on eviction)
    Queued(oneshot::Receiver<Lease>),
    /// The queue is disabled or full; deny immediately
    Rejected,
}

/// A bounded wait list owned by a single limiter instance.
///
/// Lives under the same lock as the limiter's counters, so enqueueing and
/// waking can never race a capacity decision. Waiters suspend on a oneshot
/// channel rather than spinning. A caller that cancels (drops its acquire
/// future) leaves a closed sender behind; the wake loops detect the failed
/// send and roll the capacity claim back, so cancellation never leaks.
pub(crate) struct WaitQueue {
    limit: usize,
    order: QueueOrder,
    waiters: VecDeque<oneshot::Sender<Lease>>,
}

impl WaitQueue {
    pub(crate) fn new(limit: usize, order: QueueOrder) -> Self {
        Self {
            limit,
            order,
            waiters: VecDeque::new(),
        }
    }

    /// Park a new caller, applying the queue-limit overflow policy.
    pub(crate) fn push(&mut self) -> Enqueue {
        if self.limit == 0 {
            return Enqueue::Rejected;
        }

        if self.waiters.len() >= self.limit {
            match self.order {
                QueueOrder::OldestFirst => return Enqueue::Rejected,
                QueueOrder::NewestFirst => {
                    // Evict the oldest waiter to make room for the newcomer
                    if let Some(evicted) = self.waiters.pop_front() {
                        let _ = evicted.send(Lease::denied(None));
                        trace!("evicted oldest waiter from full queue");
                    }
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.waiters.push_back(tx);
        Enqueue::Queued(rx)
    }

    /// Take the next waiter to wake, per the configured order.
    pub(crate) fn pop(&mut self) -> Option<oneshot::Sender<Lease>> {
        match self.order {
            QueueOrder::OldestFirst => self.waiters.pop_front(),
            QueueOrder::NewestFirst => self.waiters.pop_back(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.waiters.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}
