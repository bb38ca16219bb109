//! The policy registry: named policies routed to limiter instances.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::clock::Ticker;
use crate::config::{AlgorithmConfig, LimitsConfig, PolicyConfig};
use crate::error::{Result, TurnstileError};
use crate::limit::{
    ConcurrencyLimiter, FixedWindowLimiter, Lease, Limiter, LimiterMetrics, SlidingWindowLimiter,
    TokenBucketLimiter,
};

struct PolicyEntry {
    limiter: Arc<dyn Limiter>,
    /// Background replenishment task; dropping it stops the timer
    #[allow(dead_code)]
    ticker: Option<Ticker>,
}

/// Maps policy names to configured limiter instances and routes admission
/// decisions.
///
/// Each policy owns its own limiter and synchronization, so contention on
/// one policy never stalls another. The registry also owns the background
/// replenishment timers for auto-replenishing policies: they start when a
/// policy is registered and stop at [`shutdown`] or drop.
///
/// [`shutdown`]: Registry::shutdown
///
/// # Example
///
/// ```no_run
/// use turnstile::config::LimitsConfig;
/// use turnstile::registry::Registry;
///
/// # async fn example() -> turnstile::error::Result<()> {
/// let config = LimitsConfig::from_file("limits.yaml")?;
/// let registry = Registry::from_config(&config)?;
///
/// let lease = registry.try_acquire("api_default")?;
/// if !lease.is_granted() {
///     // Map to 429, surfacing lease.retry_after() as a header
/// }
/// # Ok(())
/// # }
/// ```
pub struct Registry {
    policies: DashMap<String, PolicyEntry>,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("policies", &self.policies.len())
            .finish()
    }
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            policies: DashMap::new(),
        }
    }

    /// Build a registry from a full configuration.
    ///
    /// Must be called from within a tokio runtime if any policy uses auto
    /// replenishment, since registering one spawns its timer.
    pub fn from_config(config: &LimitsConfig) -> Result<Self> {
        let registry = Self::new();
        for policy in &config.policies {
            registry.register(policy.clone())?;
        }
        Ok(registry)
    }

    /// Register a single policy, spawning its replenishment timer when the
    /// configuration asks for one.
    ///
    /// Fails fast with a configuration error on invalid parameters or a
    /// duplicate name.
    pub fn register(&self, policy: PolicyConfig) -> Result<()> {
        policy.validate()?;

        let limiter: Arc<dyn Limiter> = match &policy.algorithm {
            AlgorithmConfig::TokenBucket(cfg) => {
                Arc::new(TokenBucketLimiter::new(cfg, &policy.queue)?)
            }
            AlgorithmConfig::FixedWindow(cfg) => {
                Arc::new(FixedWindowLimiter::new(cfg, &policy.queue)?)
            }
            AlgorithmConfig::SlidingWindow(cfg) => {
                Arc::new(SlidingWindowLimiter::new(cfg, &policy.queue)?)
            }
            AlgorithmConfig::Concurrency(cfg) => {
                Arc::new(ConcurrencyLimiter::new(cfg, &policy.queue)?)
            }
        };

        match self.policies.entry(policy.name.clone()) {
            Entry::Occupied(_) => Err(TurnstileError::Config(format!(
                "duplicate policy name: {}",
                policy.name
            ))),
            Entry::Vacant(slot) => {
                let ticker = limiter
                    .replenishment_period()
                    .map(|period| Ticker::spawn(period, Arc::downgrade(&limiter)));
                info!(policy = %policy.name, "Registered admission policy");
                slot.insert(PolicyEntry { limiter, ticker });
                Ok(())
            }
        }
    }

    /// Make an immediate admission decision for a named policy.
    ///
    /// A denied decision is an ordinary lease; an error means the policy
    /// name was never registered.
    pub fn try_acquire(&self, policy: &str) -> Result<Lease> {
        let entry = self
            .policies
            .get(policy)
            .ok_or_else(|| TurnstileError::UnknownPolicy(policy.to_string()))?;
        let lease = entry.limiter.try_acquire();
        debug!(policy, granted = lease.is_granted(), "Admission decision");
        Ok(lease)
    }

    /// Make an admission decision for a named policy, waiting in its queue
    /// for capacity when one is configured.
    pub async fn acquire(&self, policy: &str) -> Result<Lease> {
        // Clone out of the map so the shard lock is not held across await
        let limiter = self
            .policies
            .get(policy)
            .map(|entry| entry.limiter.clone())
            .ok_or_else(|| TurnstileError::UnknownPolicy(policy.to_string()))?;
        Ok(limiter.acquire().await)
    }

    /// A snapshot of a policy's decision counters.
    pub fn metrics(&self, policy: &str) -> Result<LimiterMetrics> {
        let entry = self
            .policies
            .get(policy)
            .ok_or_else(|| TurnstileError::UnknownPolicy(policy.to_string()))?;
        Ok(entry.limiter.metrics())
    }

    /// Whether a policy name is registered.
    pub fn contains(&self, policy: &str) -> bool {
        self.policies.contains_key(policy)
    }

    /// The number of registered policies.
    pub fn policy_count(&self) -> usize {
        self.policies.len()
    }

    /// Stop all background replenishment timers.
    ///
    /// Registered policies keep answering decisions; auto-replenishing
    /// ones stop restoring capacity. Dropping the registry has the same
    /// effect on the timers.
    pub fn shutdown(&self) {
        for mut entry in self.policies.iter_mut() {
            entry.ticker = None;
        }
        info!("Admission registry shut down");
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConcurrencyConfig, FixedWindowConfig, QueueConfig, TokenBucketConfig};

    fn concurrency_policy(name: &str, permit_limit: u64) -> PolicyConfig {
        PolicyConfig {
            name: name.to_string(),
            algorithm: AlgorithmConfig::Concurrency(ConcurrencyConfig { permit_limit }),
            queue: QueueConfig::default(),
        }
    }

    fn fixed_policy(name: &str, permit_limit: u64, window_ms: u64) -> PolicyConfig {
        PolicyConfig {
            name: name.to_string(),
            algorithm: AlgorithmConfig::FixedWindow(FixedWindowConfig {
                permit_limit,
                window_ms,
                auto_replenishment: false,
            }),
            queue: QueueConfig::default(),
        }
    }

    #[test]
    fn test_unknown_policy_is_an_error() {
        let registry = Registry::new();
        let err = registry.try_acquire("missing").unwrap_err();
        assert!(matches!(err, TurnstileError::UnknownPolicy(_)));
    }

    #[test]
    fn test_register_and_route() {
        let registry = Registry::new();
        registry.register(fixed_policy("api", 2, 10_000)).unwrap();
        assert!(registry.contains("api"));
        assert_eq!(registry.policy_count(), 1);

        assert!(registry.try_acquire("api").unwrap().is_granted());
        assert!(registry.try_acquire("api").unwrap().is_granted());
        assert!(!registry.try_acquire("api").unwrap().is_granted());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = Registry::new();
        registry.register(concurrency_policy("dup", 1)).unwrap();
        let err = registry.register(concurrency_policy("dup", 2)).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
        assert_eq!(registry.policy_count(), 1);
    }

    #[test]
    fn test_invalid_policy_rejected() {
        let registry = Registry::new();
        let err = registry.register(concurrency_policy("bad", 0)).unwrap_err();
        assert!(matches!(err, TurnstileError::Config(_)));
        assert!(!registry.contains("bad"));
    }

    #[test]
    fn test_policies_are_isolated() {
        let registry = Registry::new();
        registry.register(fixed_policy("small", 1, 10_000)).unwrap();
        registry.register(fixed_policy("large", 100, 10_000)).unwrap();

        assert!(registry.try_acquire("small").unwrap().is_granted());
        assert!(!registry.try_acquire("small").unwrap().is_granted());

        // Exhausting one policy leaves the other untouched
        for _ in 0..50 {
            assert!(registry.try_acquire("large").unwrap().is_granted());
        }
        assert_eq!(registry.metrics("large").unwrap().available, 50);
    }

    #[test]
    fn test_metrics_snapshot() {
        let registry = Registry::new();
        registry.register(fixed_policy("api", 1, 10_000)).unwrap();

        assert!(registry.try_acquire("api").unwrap().is_granted());
        assert!(!registry.try_acquire("api").unwrap().is_granted());

        let metrics = registry.metrics("api").unwrap();
        assert_eq!(metrics.total_granted, 1);
        assert_eq!(metrics.total_denied, 1);
        assert_eq!(metrics.available, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_replenishment_through_the_registry() {
        let registry = Registry::new();
        registry
            .register(PolicyConfig {
                name: "tokens".into(),
                algorithm: AlgorithmConfig::TokenBucket(TokenBucketConfig {
                    token_limit: 2,
                    tokens_per_period: 1,
                    replenishment_period_ms: 1000,
                    auto_replenishment: true,
                }),
                queue: QueueConfig::default(),
            })
            .unwrap();

        assert!(registry.try_acquire("tokens").unwrap().is_granted());
        assert!(registry.try_acquire("tokens").unwrap().is_granted());
        assert!(!registry.try_acquire("tokens").unwrap().is_granted());

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert!(registry.try_acquire("tokens").unwrap().is_granted());
        assert!(!registry.try_acquire("tokens").unwrap().is_granted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_replenishment() {
        let registry = Registry::new();
        registry
            .register(PolicyConfig {
                name: "tokens".into(),
                algorithm: AlgorithmConfig::TokenBucket(TokenBucketConfig {
                    token_limit: 1,
                    tokens_per_period: 1,
                    replenishment_period_ms: 1000,
                    auto_replenishment: true,
                }),
                queue: QueueConfig::default(),
            })
            .unwrap();

        assert!(registry.try_acquire("tokens").unwrap().is_granted());
        registry.shutdown();

        tokio::time::sleep(std::time::Duration::from_millis(2500)).await;
        assert!(!registry.try_acquire("tokens").unwrap().is_granted());
    }
}
