//! Turnstile - In-Process Request Admission Control
//!
//! This crate implements a request admission-control library: given a named
//! policy and an incoming request, it decides synchronously whether to
//! admit, queue, or reject, enforcing one of four rate-limiting
//! disciplines (token bucket, fixed window, sliding window, concurrency).
//! All state is process-local; the HTTP layer that maps denials to 429
//! responses lives outside this crate.
//!
//! ```no_run
//! use turnstile::{LimitsConfig, Registry};
//!
//! # fn example() -> turnstile::Result<()> {
//! let config = LimitsConfig::from_yaml(
//!     r#"
//! policies:
//!   - name: api_default
//!     algorithm: fixed_window
//!     permit_limit: 10
//!     window_ms: 10000
//! "#,
//! )?;
//! let registry = Registry::from_config(&config)?;
//!
//! let lease = registry.try_acquire("api_default")?;
//! if !lease.is_granted() {
//!     // Reject the request, surfacing lease.retry_after() as a hint
//! }
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod limit;
pub mod registry;

pub use config::{
    AlgorithmConfig, ConcurrencyConfig, FixedWindowConfig, LimitsConfig, PolicyConfig,
    QueueConfig, QueueOrder, SlidingWindowConfig, TokenBucketConfig,
};
pub use error::{Result, TurnstileError};
pub use limit::{
    ConcurrencyLimiter, FixedWindowLimiter, Lease, Limiter, LimiterMetrics, SlidingWindowLimiter,
    TokenBucketLimiter,
};
pub use registry::Registry;
