//! Policy configuration loading and validation.
//!
//! A [`LimitsConfig`] describes a set of named admission policies, each
//! selecting one rate-limiting algorithm and its parameters. Configuration
//! is immutable once a policy is constructed; validation happens up front
//! and fails fast rather than clamping bad values.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};

fn default_auto_replenishment() -> bool {
    true
}

/// A complete admission-control configuration containing multiple policies.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// The named policies to register
    #[serde(default)]
    pub policies: Vec<PolicyConfig>,
}

impl LimitsConfig {
    /// Create an empty configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading admission policy configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("failed to parse policy config: {}", e)))
    }

    /// Load configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| TurnstileError::Config(format!("failed to parse policy config: {}", e)))
    }

    /// Validate every policy, including name uniqueness.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for policy in &self.policies {
            policy.validate()?;
            if !names.insert(policy.name.as_str()) {
                return Err(TurnstileError::Config(format!(
                    "duplicate policy name: {}",
                    policy.name
                )));
            }
        }
        Ok(())
    }
}

/// Configuration for a single named admission policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Unique policy name, used to route decisions
    pub name: String,

    /// The rate-limiting algorithm and its parameters
    #[serde(flatten)]
    pub algorithm: AlgorithmConfig,

    /// Wait-queue behavior for denied callers
    #[serde(default)]
    pub queue: QueueConfig,
}

impl PolicyConfig {
    /// Validate the policy name and algorithm parameters.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(TurnstileError::Config("policy name must not be empty".into()));
        }
        self.algorithm.validate()
    }
}

/// The closed set of rate-limiting algorithms.
///
/// Selected once at construction; there is no runtime switching.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum AlgorithmConfig {
    /// Replenishing token counter
    TokenBucket(TokenBucketConfig),
    /// Counter reset on fixed window boundaries
    FixedWindow(FixedWindowConfig),
    /// Segmented counter approximating a continuous trailing window
    SlidingWindow(SlidingWindowConfig),
    /// In-flight request counter with explicit release
    Concurrency(ConcurrencyConfig),
}

impl AlgorithmConfig {
    /// Validate the algorithm parameters.
    pub fn validate(&self) -> Result<()> {
        match self {
            AlgorithmConfig::TokenBucket(cfg) => cfg.validate(),
            AlgorithmConfig::FixedWindow(cfg) => cfg.validate(),
            AlgorithmConfig::SlidingWindow(cfg) => cfg.validate(),
            AlgorithmConfig::Concurrency(cfg) => cfg.validate(),
        }
    }
}

/// Token bucket parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucketConfig {
    /// Maximum tokens the bucket can hold (burst capacity)
    pub token_limit: u64,

    /// Tokens restored on each replenishment tick
    pub tokens_per_period: u64,

    /// Interval between replenishment ticks in milliseconds
    pub replenishment_period_ms: u64,

    /// When false, replenishment only happens via an explicit
    /// `replenish()` call instead of a background timer
    #[serde(default = "default_auto_replenishment")]
    pub auto_replenishment: bool,
}

impl TokenBucketConfig {
    /// The replenishment interval as a `Duration`.
    pub fn replenishment_period(&self) -> Duration {
        Duration::from_millis(self.replenishment_period_ms)
    }

    /// Validate the parameters.
    pub fn validate(&self) -> Result<()> {
        if self.token_limit == 0 {
            return Err(TurnstileError::Config("token_limit must be positive".into()));
        }
        if self.tokens_per_period == 0 {
            return Err(TurnstileError::Config(
                "tokens_per_period must be positive".into(),
            ));
        }
        if self.replenishment_period_ms == 0 {
            return Err(TurnstileError::Config(
                "replenishment_period_ms must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Fixed window parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedWindowConfig {
    /// Maximum requests admitted per window
    pub permit_limit: u64,

    /// Window length in milliseconds
    pub window_ms: u64,

    /// When false, window resets happen only on the acquire path and
    /// queued callers are not woken at the boundary
    #[serde(default = "default_auto_replenishment")]
    pub auto_replenishment: bool,
}

impl FixedWindowConfig {
    /// The window length as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Validate the parameters.
    pub fn validate(&self) -> Result<()> {
        if self.permit_limit == 0 {
            return Err(TurnstileError::Config("permit_limit must be positive".into()));
        }
        if self.window_ms == 0 {
            return Err(TurnstileError::Config("window_ms must be positive".into()));
        }
        Ok(())
    }
}

/// Sliding window parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlidingWindowConfig {
    /// Maximum requests admitted within the trailing window
    pub permit_limit: u64,

    /// Window length in milliseconds
    pub window_ms: u64,

    /// Number of segments the window is divided into; must evenly
    /// divide the window
    pub segments_per_window: u32,

    /// When false, segment rollover happens only on the acquire path and
    /// queued callers are not woken at segment boundaries
    #[serde(default = "default_auto_replenishment")]
    pub auto_replenishment: bool,
}

impl SlidingWindowConfig {
    /// The window length as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// The length of a single segment as a `Duration`.
    pub fn segment_length(&self) -> Duration {
        Duration::from_millis(self.window_ms / u64::from(self.segments_per_window))
    }

    /// Validate the parameters.
    pub fn validate(&self) -> Result<()> {
        if self.permit_limit == 0 {
            return Err(TurnstileError::Config("permit_limit must be positive".into()));
        }
        if self.window_ms == 0 {
            return Err(TurnstileError::Config("window_ms must be positive".into()));
        }
        if self.segments_per_window == 0 {
            return Err(TurnstileError::Config(
                "segments_per_window must be positive".into(),
            ));
        }
        if self.window_ms % u64::from(self.segments_per_window) != 0 {
            return Err(TurnstileError::Config(format!(
                "segments_per_window ({}) must evenly divide window_ms ({})",
                self.segments_per_window, self.window_ms
            )));
        }
        Ok(())
    }
}

/// Concurrency limiter parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Maximum requests in flight at once
    pub permit_limit: u64,
}

impl ConcurrencyConfig {
    /// Validate the parameters.
    pub fn validate(&self) -> Result<()> {
        if self.permit_limit == 0 {
            return Err(TurnstileError::Config("permit_limit must be positive".into()));
        }
        Ok(())
    }
}

/// Wait-queue behavior for denied callers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum callers held waiting for capacity; 0 disables queueing
    /// and makes every denial immediate
    #[serde(default)]
    pub limit: usize,

    /// Order in which waiting callers are woken
    #[serde(default)]
    pub order: QueueOrder,
}

/// Processing order for queued callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueOrder {
    /// Wake the longest-waiting caller first; a full queue rejects newcomers
    #[default]
    OldestFirst,
    /// Wake the most recent caller first; a full queue evicts the oldest
    /// waiter to make room for the newcomer
    NewestFirst,
}
