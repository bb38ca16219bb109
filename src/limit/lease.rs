//! The result object of an admission decision.

use std::time::Duration;

use super::concurrency::Permit;

/// The outcome of a capacity decision: granted or denied, with an optional
/// retry hint or an owned concurrency permit.
///
/// Denial is data, not an error, so the hot path never takes exceptional
/// control flow. A granted lease from a [`ConcurrencyLimiter`] owns a
/// permit that is returned when the lease is dropped or explicitly
/// [`release`]d; the other algorithms consume capacity permanently until
/// the next window or tick and their leases carry nothing to release.
///
/// [`ConcurrencyLimiter`]: super::ConcurrencyLimiter
/// [`release`]: Lease::release
#[derive(Debug)]
#[must_use = "a concurrency lease holds capacity until released or dropped"]
pub struct Lease {
    granted: bool,
    retry_after: Option<Duration>,
    permit: Option<Permit>,
}

impl Lease {
    pub(crate) fn granted() -> Self {
        Self {
            granted: true,
            retry_after: None,
            permit: None,
        }
    }

    pub(crate) fn with_permit(permit: Permit) -> Self {
        Self {
            granted: true,
            retry_after: None,
            permit: Some(permit),
        }
    }

    pub(crate) fn denied(retry_after: Option<Duration>) -> Self {
        Self {
            granted: false,
            retry_after,
            permit: None,
        }
    }

    /// Whether the request was admitted.
    pub fn is_granted(&self) -> bool {
        self.granted
    }

    /// Time until capacity may next become available.
    ///
    /// Only present on denial, and only when the limiter can compute a
    /// deterministic next-available time. Concurrency denials carry no
    /// hint since admission depends on other callers finishing.
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }

    /// Return held concurrency capacity.
    ///
    /// Idempotent: releasing twice decrements the in-flight count exactly
    /// once. A no-op on leases from the window and bucket algorithms.
    /// Dropping the lease has the same effect, so scoped callers get a
    /// guaranteed release on every exit path.
    pub fn release(&self) {
        if let Some(permit) = &self.permit {
            permit.release();
        }
    }

    /// Mark the permit as already released without touching the limiter.
    ///
    /// Used when handing a slot to a queued waiter fails: the slot is still
    /// held by the wake loop, which runs under the limiter lock, and a
    /// releasing drop here would re-enter that lock.
    pub(crate) fn disarm(&self) {
        if let Some(permit) = &self.permit {
            permit.disarm();
        }
    }
}
