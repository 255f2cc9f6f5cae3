//! Relay configuration.
//!
//! Everything here is set once at construction time, never per call. The
//! whole tree is serde-derived so hosts can keep it in a JSON settings file
//! next to their other game configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::error::{RelayError, RelayResult};
use crate::replay::ReplayMode;
use crate::request::Tier;
use crate::usage::PricingTable;

/// Admission and scheduling bounds for one priority tier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierConfig {
    /// Maximum number of pending (not yet dispatched) requests.
    pub max_pending: usize,
    /// Maximum number of concurrently in-flight requests.
    pub max_in_flight: usize,
    /// Response deadline in milliseconds, measured from submission.
    pub deadline_ms: u64,
}

/// Per-tier bounds for the request queue.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    pub high: TierConfig,
    pub medium: TierConfig,
    pub low: TierConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            high: TierConfig {
                max_pending: 5,
                max_in_flight: 1,
                deadline_ms: 3_000,
            },
            medium: TierConfig {
                max_pending: 3,
                max_in_flight: 1,
                deadline_ms: 10_000,
            },
            low: TierConfig {
                max_pending: 10,
                max_in_flight: 3,
                deadline_ms: 5_000,
            },
        }
    }
}

impl QueueConfig {
    /// Bounds for the given tier.
    pub fn tier(&self, tier: Tier) -> TierConfig {
        match tier {
            Tier::High => self.high,
            Tier::Medium => self.medium,
            Tier::Low => self.low,
        }
    }
}

/// Token-bucket admission gate parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Maximum number of admission tokens the bucket holds.
    pub capacity: f64,
    /// Tokens restored per second.
    pub refill_rate: f64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            capacity: 10.0,
            refill_rate: 1.0,
        }
    }
}

/// Response cache parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries before FIFO eviction kicks in.
    pub capacity: usize,
    /// Time-to-live applied to entries written by the relay, in milliseconds.
    pub ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1_000,
            ttl_ms: 60_000,
        }
    }
}

/// Retry/backoff policy parameters for the error recovery manager.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries per provider after the initial attempt.
    pub max_retries: u32,
    /// Base delay for exponential backoff, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on the pre-jitter delay, in milliseconds.
    pub max_delay_ms: u64,
    /// Jitter factor `j`; the jittered delay lies in `delay × [1−j, 1+j]`.
    /// Must be in `[0, 1)`.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 250,
            max_delay_ms: 4_000,
            jitter_factor: 0.2,
        }
    }
}

/// Provider health routing parameters for the failover chain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FailoverConfig {
    /// Consecutive failures before a provider is marked degraded.
    pub degraded_after: u32,
    /// How long a degraded provider is skipped before it is probed again,
    /// in milliseconds.
    pub cooldown_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            degraded_after: 3,
            cooldown_ms: 30_000,
        }
    }
}

/// Advisory budget alert thresholds (cumulative cost, USD).
///
/// Each threshold fires exactly once when crossed; the relay never blocks a
/// request on budget grounds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub thresholds_usd: Vec<f64>,
}

impl BudgetConfig {
    /// No alerts at all.
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn with_threshold(mut self, usd: f64) -> Self {
        self.thresholds_usd.push(usd);
        self
    }
}

/// Record/replay selection for the lifetime of the run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayConfig {
    /// Record (default) or Replay. Mutually exclusive per run.
    pub mode: ReplayMode,
    /// Replay-log path. Required in Replay mode; optional in Record mode
    /// (used by `flush_replay_log`).
    pub log_path: Option<PathBuf>,
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub limiter: LimiterConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    /// Per-model pricing table used by the usage tracker.
    #[serde(default = "PricingTable::with_defaults")]
    pub pricing: PricingTable,
    /// Seed for the backoff-jitter RNG. Fixed here (rather than entropy-based)
    /// so a recorded run and its replay schedule retries identically.
    #[serde(default)]
    pub rng_seed: u64,
}

impl RelayConfig {
    /// Parse a configuration from a JSON string.
    pub fn from_json(json: &str) -> RelayResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(RelayError::from)
            .map_err(error_stack::Report::new)?;
        config
            .validate()
            .map_err(RelayError::from)
            .map_err(error_stack::Report::new)?;
        Ok(config)
    }

    /// Load a configuration from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> RelayResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(RelayError::from)
            .map_err(error_stack::Report::new)
            .map_err(|r| r.attach(format!("reading {}", path.display())))?;
        Self::from_json(&raw)
    }

    /// Check every bound that would otherwise produce a silently broken relay.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for tier in Tier::ALL {
            let t = self.queue.tier(tier);
            if t.max_pending == 0 {
                return Err(ConfigError::InvalidTier(tier, "max_pending must be > 0"));
            }
            if t.max_in_flight == 0 {
                return Err(ConfigError::InvalidTier(tier, "max_in_flight must be > 0"));
            }
            if t.deadline_ms == 0 {
                return Err(ConfigError::InvalidTier(tier, "deadline_ms must be > 0"));
            }
        }
        if self.limiter.capacity < 1.0 {
            return Err(ConfigError::InvalidLimiter("capacity must be >= 1"));
        }
        if self.limiter.refill_rate <= 0.0 {
            return Err(ConfigError::InvalidLimiter("refill_rate must be > 0"));
        }
        if self.cache.capacity == 0 {
            return Err(ConfigError::InvalidCache("capacity must be > 0"));
        }
        if self.cache.ttl_ms == 0 {
            return Err(ConfigError::InvalidCache("ttl_ms must be > 0"));
        }
        if !(0.0..1.0).contains(&self.retry.jitter_factor) {
            return Err(ConfigError::InvalidRetry("jitter_factor must be in [0, 1)"));
        }
        if self.retry.base_delay_ms == 0 || self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(ConfigError::InvalidRetry(
                "base_delay_ms must be > 0 and <= max_delay_ms",
            ));
        }
        if self.failover.degraded_after == 0 {
            return Err(ConfigError::InvalidFailover("degraded_after must be > 0"));
        }
        if self.budget.thresholds_usd.iter().any(|t| *t <= 0.0) {
            return Err(ConfigError::InvalidBudget(
                "thresholds_usd must all be > 0",
            ));
        }
        if self.replay.mode == ReplayMode::Replay && self.replay.log_path.is_none() {
            return Err(ConfigError::MissingReplayLog);
        }
        Ok(())
    }
}

/// Validation and parse errors for [`RelayConfig`].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("invalid {0} tier config: {1}")]
    InvalidTier(Tier, &'static str),

    #[error("invalid limiter config: {0}")]
    InvalidLimiter(&'static str),

    #[error("invalid cache config: {0}")]
    InvalidCache(&'static str),

    #[error("invalid retry config: {0}")]
    InvalidRetry(&'static str),

    #[error("invalid failover config: {0}")]
    InvalidFailover(&'static str),

    #[error("invalid budget config: {0}")]
    InvalidBudget(&'static str),

    #[error("replay mode requires replay.log_path to be set")]
    MissingReplayLog,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_bounds() {
        let config = RelayConfig::default();
        assert_eq!(config.queue.high.max_pending, 5);
        assert_eq!(config.queue.medium.max_pending, 3);
        assert_eq!(config.queue.low.max_pending, 10);
        assert_eq!(config.queue.high.max_in_flight, 1);
        assert_eq!(config.queue.low.max_in_flight, 3);
        assert_eq!(config.queue.high.deadline_ms, 3_000);
        assert_eq!(config.queue.medium.deadline_ms, 10_000);
        assert_eq!(config.queue.low.deadline_ms, 5_000);
        assert_eq!(config.cache.capacity, 1_000);
        assert_eq!(config.retry.max_retries, 3);
        config.validate().unwrap();
    }

    #[test]
    fn zero_pending_is_rejected() {
        let mut config = RelayConfig::default();
        config.queue.medium.max_pending = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTier(Tier::Medium, _))
        ));
    }

    #[test]
    fn jitter_factor_bounds_are_enforced() {
        let mut config = RelayConfig::default();
        config.retry.jitter_factor = 1.0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidRetry(_))
        ));
        config.retry.jitter_factor = 0.0;
        config.validate().unwrap();
    }

    #[test]
    fn replay_mode_requires_log_path() {
        let mut config = RelayConfig::default();
        config.replay.mode = ReplayMode::Replay;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingReplayLog)
        ));
        config.replay.log_path = Some("session.jsonl".into());
        config.validate().unwrap();
    }

    #[test]
    fn json_round_trip_preserves_overrides() {
        let json = r#"{
            "queue": {
                "high":   { "max_pending": 8, "max_in_flight": 2, "deadline_ms": 2000 },
                "medium": { "max_pending": 3, "max_in_flight": 1, "deadline_ms": 10000 },
                "low":    { "max_pending": 10, "max_in_flight": 3, "deadline_ms": 5000 }
            },
            "limiter": { "capacity": 4.0, "refill_rate": 0.5 },
            "budget": { "thresholds_usd": [1.0, 5.0] }
        }"#;
        let config = RelayConfig::from_json(json).unwrap();
        assert_eq!(config.queue.high.max_pending, 8);
        assert_eq!(config.limiter.capacity, 4.0);
        assert_eq!(config.budget.thresholds_usd, vec![1.0, 5.0]);
        // Unspecified sections keep their defaults.
        assert_eq!(config.cache.capacity, 1_000);
    }

    #[test]
    fn invalid_json_reports_serialization_error() {
        let err = RelayConfig::from_json("{ not json").unwrap_err();
        assert!(format!("{err:?}").contains("Serialization"));
    }

    #[test]
    fn parsed_config_is_still_validated() {
        // Well-formed JSON carrying out-of-range bounds.
        let json = r#"{ "limiter": { "capacity": 0.0, "refill_rate": 1.0 } }"#;
        let err = RelayConfig::from_json(json).unwrap_err();
        assert!(format!("{err:?}").contains("capacity"));
    }
}
