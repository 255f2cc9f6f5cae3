//! Provider failover chain and health state machine.
//!
//! The chain holds providers in fixed priority order, the terminal entry
//! being the infallible offline fallback. Health transitions:
//!
//! ```text
//!   Healthy --(degraded_after consecutive failures)--> Degraded
//!   Degraded --(1 success)--> Healthy
//!   any --(is_available() == false at routing time)--> Down
//! ```
//!
//! Degraded and Down providers are skipped proactively for a cool-down
//! window, then probed again while still marked Degraded. The terminal
//! provider is always routable regardless of recorded health.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::FailoverConfig;
use crate::provider::SharedProvider;

/// Provider health states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Normal operation.
    Healthy,
    /// Too many consecutive failures; skipped for a cool-down window.
    Degraded,
    /// The provider's own availability probe reports it unusable. Routes
    /// identically to Degraded.
    Down,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Down => write!(f, "down"),
        }
    }
}

/// Mutable health record for one provider in the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub provider: String,
    pub status: HealthStatus,
    pub consecutive_failures: u32,
    pub last_success_ms: Option<u64>,
    /// When the provider left Healthy, for cool-down bookkeeping.
    unhealthy_since_ms: Option<u64>,
}

impl ProviderHealth {
    fn new(provider: String) -> Self {
        Self {
            provider,
            status: HealthStatus::Healthy,
            consecutive_failures: 0,
            last_success_ms: None,
            unhealthy_since_ms: None,
        }
    }

    fn record_success(&mut self, now_ms: u64) {
        let was = self.status;
        self.consecutive_failures = 0;
        self.last_success_ms = Some(now_ms);
        self.status = HealthStatus::Healthy;
        self.unhealthy_since_ms = None;
        if was != HealthStatus::Healthy {
            info!(provider = %self.provider, from = %was, "provider recovered");
        }
    }

    fn record_failure(&mut self, now_ms: u64, degraded_after: u32) {
        self.consecutive_failures += 1;
        match self.status {
            HealthStatus::Healthy => {
                if self.consecutive_failures >= degraded_after {
                    self.status = HealthStatus::Degraded;
                    self.unhealthy_since_ms = Some(now_ms);
                    warn!(
                        provider = %self.provider,
                        failures = self.consecutive_failures,
                        "provider marked degraded"
                    );
                }
            }
            // A failed post-cool-down probe restarts the window.
            HealthStatus::Degraded | HealthStatus::Down => {
                self.unhealthy_since_ms = Some(now_ms);
            }
        }
    }

    fn mark_down(&mut self, now_ms: u64) {
        if self.status != HealthStatus::Down {
            warn!(provider = %self.provider, "provider reports unavailable, marked down");
            self.status = HealthStatus::Down;
            self.unhealthy_since_ms.get_or_insert(now_ms);
        }
    }

    /// Whether the router may send a request here right now.
    fn is_routable(&self, now_ms: u64, cooldown_ms: u64) -> bool {
        match self.status {
            HealthStatus::Healthy => true,
            HealthStatus::Degraded | HealthStatus::Down => self
                .unhealthy_since_ms
                .is_none_or(|since| now_ms.saturating_sub(since) >= cooldown_ms),
        }
    }
}

/// Ordered providers plus their health records.
pub struct FailoverChain {
    providers: Vec<SharedProvider>,
    health: Vec<ProviderHealth>,
    config: FailoverConfig,
}

impl FailoverChain {
    /// Build a chain. The caller guarantees the last provider is the
    /// infallible terminal fallback; `LlmRelay`'s builder appends it.
    pub fn new(providers: Vec<SharedProvider>, config: FailoverConfig) -> Self {
        assert!(!providers.is_empty(), "failover chain cannot be empty");
        let health = providers
            .iter()
            .map(|p| ProviderHealth::new(p.name().to_string()))
            .collect();
        Self {
            providers,
            health,
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Index of the terminal fallback provider.
    pub fn terminal_index(&self) -> usize {
        self.providers.len() - 1
    }

    pub fn provider(&self, idx: usize) -> &SharedProvider {
        &self.providers[idx]
    }

    /// First routable provider at or after `start`, consulting availability
    /// probes and health cool-downs. The terminal provider is always
    /// routable, so this never fails for `start <= terminal_index()`.
    pub fn route_from(&mut self, start: usize, now_ms: u64) -> usize {
        let terminal = self.terminal_index();
        for idx in start..terminal {
            if !self.providers[idx].is_available() {
                self.health[idx].mark_down(now_ms);
            }
            if self.health[idx].is_routable(now_ms, self.config.cooldown_ms) {
                return idx;
            }
        }
        terminal
    }

    pub fn record_success(&mut self, idx: usize, now_ms: u64) {
        self.health[idx].record_success(now_ms);
    }

    pub fn record_failure(&mut self, idx: usize, now_ms: u64) {
        self.health[idx].record_failure(now_ms, self.config.degraded_after);
    }

    /// Advisory flag: true while any non-terminal provider is not healthy.
    /// Does not itself block or alter requests.
    pub fn degraded_mode(&self) -> bool {
        self.health[..self.terminal_index()]
            .iter()
            .any(|h| h.status != HealthStatus::Healthy)
    }

    /// Snapshot of every provider's health, in chain order.
    pub fn health_snapshot(&self) -> Vec<ProviderHealth> {
        self.health.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{OfflineProvider, ScriptedProvider};
    use std::sync::Arc;

    fn chain_with_primary() -> (FailoverChain, Arc<ScriptedProvider>) {
        let primary = Arc::new(ScriptedProvider::new("primary", vec![]));
        let chain = FailoverChain::new(
            vec![
                primary.clone() as SharedProvider,
                Arc::new(OfflineProvider::new()),
            ],
            FailoverConfig {
                degraded_after: 3,
                cooldown_ms: 1_000,
            },
        );
        (chain, primary)
    }

    #[test]
    fn healthy_provider_routes_first() {
        let (mut chain, _primary) = chain_with_primary();
        assert_eq!(chain.route_from(0, 0), 0);
        assert!(!chain.degraded_mode());
    }

    #[test]
    fn three_consecutive_failures_degrade_then_one_success_heals() {
        let (mut chain, _primary) = chain_with_primary();
        chain.record_failure(0, 10);
        chain.record_failure(0, 20);
        assert_eq!(chain.health_snapshot()[0].status, HealthStatus::Healthy);

        chain.record_failure(0, 30);
        assert_eq!(chain.health_snapshot()[0].status, HealthStatus::Degraded);
        assert!(chain.degraded_mode());

        chain.record_success(0, 40);
        assert_eq!(chain.health_snapshot()[0].status, HealthStatus::Healthy);
        assert_eq!(chain.health_snapshot()[0].consecutive_failures, 0);
        assert!(!chain.degraded_mode());
    }

    #[test]
    fn degraded_provider_is_skipped_until_cooldown_elapses() {
        let (mut chain, _primary) = chain_with_primary();
        for _ in 0..3 {
            chain.record_failure(0, 100);
        }
        // Inside the cool-down window the router lands on the terminal entry.
        assert_eq!(chain.route_from(0, 500), 1);
        // After the window the degraded provider gets a probe attempt.
        assert_eq!(chain.route_from(0, 1_100), 0);
        assert_eq!(chain.health_snapshot()[0].status, HealthStatus::Degraded);
    }

    #[test]
    fn failed_probe_restarts_the_cooldown() {
        let (mut chain, _primary) = chain_with_primary();
        for _ in 0..3 {
            chain.record_failure(0, 0);
        }
        assert_eq!(chain.route_from(0, 500), 1);

        // Cool-down elapsed: the degraded provider gets one probe attempt.
        assert_eq!(chain.route_from(0, 1_100), 0);
        chain.record_failure(0, 1_100);

        // The failed probe restarts the window; the provider is skipped
        // again until another full cool-down passes.
        assert_eq!(chain.route_from(0, 1_101), 1);
        assert_eq!(chain.route_from(0, 1_900), 1);
        assert_eq!(chain.route_from(0, 2_100), 0);
    }

    #[test]
    fn unavailable_provider_is_marked_down_and_skipped() {
        let (mut chain, primary) = chain_with_primary();
        primary.set_available(false);
        assert_eq!(chain.route_from(0, 0), 1);
        assert_eq!(chain.health_snapshot()[0].status, HealthStatus::Down);
        assert!(chain.degraded_mode());

        // Down routes like Degraded: probed again after the cool-down.
        primary.set_available(true);
        assert_eq!(chain.route_from(0, 2_000), 0);
        chain.record_success(0, 2_000);
        assert_eq!(chain.health_snapshot()[0].status, HealthStatus::Healthy);
    }

    #[test]
    fn terminal_provider_is_always_routable() {
        let (mut chain, _primary) = chain_with_primary();
        for _ in 0..3 {
            chain.record_failure(0, 0);
        }
        assert_eq!(chain.route_from(0, 0), chain.terminal_index());
        assert_eq!(chain.route_from(chain.terminal_index(), 0), 1);
    }

    #[test]
    fn degraded_mode_ignores_terminal_health() {
        let (mut chain, _primary) = chain_with_primary();
        // Failures recorded against the terminal entry never raise the flag.
        chain.record_failure(1, 0);
        chain.record_failure(1, 0);
        chain.record_failure(1, 0);
        assert!(!chain.degraded_mode());
    }
}
