//! Error recovery: exponential backoff with jitter, and the per-call
//! recovery state machine driven by the relay's pump.
//!
//! A call starts on the first routable provider. Retryable errors back off
//! and retry the same provider up to `max_retries` times; fatal errors (or
//! retry exhaustion) advance to the next provider in the chain. The terminal
//! offline provider never fails, so every call eventually succeeds.

use rand::Rng;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::failover::FailoverChain;
use crate::provider::ProviderError;

/// Backoff policy: `delay = min(max_delay, base × 2^retry)`, then
/// `jittered = delay × (1 + uniform(−jitter, +jitter))`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
    jitter_factor: f64,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            jitter_factor: config.jitter_factor.clamp(0.0, 0.999),
        }
    }

    /// Retries allowed per provider after the initial attempt.
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Pre-jitter delay for retry `n` (0-indexed).
    pub fn delay_ms(&self, retry: u32) -> u64 {
        let exp = self.base_delay_ms.saturating_mul(1u64 << retry.min(32));
        exp.min(self.max_delay_ms)
    }

    /// Jittered delay for retry `n`: stays within
    /// `[delay × (1 − j), delay × (1 + j)]`.
    pub fn jittered_delay_ms(&self, retry: u32, rng: &mut impl Rng) -> u64 {
        let delay = self.delay_ms(retry) as f64;
        let factor = if self.jitter_factor > 0.0 {
            1.0 + rng.gen_range(-self.jitter_factor..=self.jitter_factor)
        } else {
            1.0
        };
        (delay * factor).round().max(0.0) as u64
    }
}

/// Recovery bookkeeping for one in-flight call.
#[derive(Debug)]
pub struct RecoveryState {
    /// Index of the provider currently handling the call.
    pub provider_idx: usize,
    /// Retries already burned on the current provider.
    pub retries: u32,
    /// Earliest time the next attempt may be dispatched.
    pub next_attempt_at_ms: u64,
    /// True while a dispatched attempt has not yet reported back.
    pub awaiting_result: bool,
}

impl RecoveryState {
    /// Start recovery on the first routable provider.
    pub fn start(chain: &mut FailoverChain, now_ms: u64) -> Self {
        Self {
            provider_idx: chain.route_from(0, now_ms),
            retries: 0,
            next_attempt_at_ms: now_ms,
            awaiting_result: false,
        }
    }

    /// Whether an attempt should be dispatched now.
    pub fn ready(&self, now_ms: u64) -> bool {
        !self.awaiting_result && now_ms >= self.next_attempt_at_ms
    }

    /// Record a failed attempt and decide the next step: either schedule a
    /// backoff retry on the same provider, or advance the chain.
    pub fn on_failure(
        &mut self,
        error: &ProviderError,
        policy: &RetryPolicy,
        chain: &mut FailoverChain,
        now_ms: u64,
        rng: &mut impl Rng,
    ) {
        chain.record_failure(self.provider_idx, now_ms);
        self.awaiting_result = false;

        if error.is_retryable() && self.retries < policy.max_retries() {
            let delay = policy.jittered_delay_ms(self.retries, rng);
            self.retries += 1;
            self.next_attempt_at_ms = now_ms + delay;
            debug!(
                provider = %chain.provider(self.provider_idx).name(),
                retry = self.retries,
                delay_ms = delay,
                error = %error,
                "retrying provider after backoff"
            );
        } else {
            let from = chain.provider(self.provider_idx).name().to_string();
            self.provider_idx = chain.route_from(self.provider_idx + 1, now_ms);
            self.retries = 0;
            self.next_attempt_at_ms = now_ms;
            warn!(
                from = %from,
                to = %chain.provider(self.provider_idx).name(),
                error = %error,
                "advancing failover chain"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FailoverConfig;
    use crate::provider::{OfflineProvider, ScriptedProvider, SharedProvider};
    use rand::SeedableRng;
    use rand::rngs::SmallRng;
    use std::sync::Arc;

    fn policy(base: u64, max: u64, jitter: f64) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries: 3,
            base_delay_ms: base,
            max_delay_ms: max,
            jitter_factor: jitter,
        })
    }

    fn three_provider_chain() -> FailoverChain {
        FailoverChain::new(
            vec![
                Arc::new(ScriptedProvider::new("primary", vec![])) as SharedProvider,
                Arc::new(ScriptedProvider::new("secondary", vec![])),
                Arc::new(OfflineProvider::new()),
            ],
            FailoverConfig::default(),
        )
    }

    // ------------------------------------------------------------------
    // Backoff arithmetic
    // ------------------------------------------------------------------

    #[test]
    fn pre_jitter_delay_doubles_and_caps() {
        let policy = policy(250, 4_000, 0.0);
        assert_eq!(policy.delay_ms(0), 250);
        assert_eq!(policy.delay_ms(1), 500);
        assert_eq!(policy.delay_ms(2), 1_000);
        assert_eq!(policy.delay_ms(3), 2_000);
        assert_eq!(policy.delay_ms(4), 4_000);
        assert_eq!(policy.delay_ms(10), 4_000);
    }

    #[test]
    fn jittered_delay_stays_within_band() {
        let policy = policy(1_000, 60_000, 0.25);
        let mut rng = SmallRng::seed_from_u64(7);
        for retry in 0..4 {
            let delay = policy.delay_ms(retry) as f64;
            for _ in 0..200 {
                let jittered = policy.jittered_delay_ms(retry, &mut rng) as f64;
                assert!(jittered >= (delay * 0.75).floor());
                assert!(jittered <= (delay * 1.25).ceil());
            }
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        let policy = policy(300, 10_000, 0.0);
        let mut rng = SmallRng::seed_from_u64(1);
        assert_eq!(policy.jittered_delay_ms(2, &mut rng), 1_200);
    }

    // ------------------------------------------------------------------
    // Recovery state machine
    // ------------------------------------------------------------------

    #[test]
    fn retryable_errors_back_off_on_the_same_provider() {
        let mut chain = three_provider_chain();
        let policy = policy(100, 1_000, 0.0);
        let mut rng = SmallRng::seed_from_u64(0);
        let mut state = RecoveryState::start(&mut chain, 0);
        assert_eq!(state.provider_idx, 0);
        assert!(state.ready(0));

        state.awaiting_result = true;
        state.on_failure(
            &ProviderError::Timeout("t".into()),
            &policy,
            &mut chain,
            0,
            &mut rng,
        );
        assert_eq!(state.provider_idx, 0);
        assert_eq!(state.retries, 1);
        assert_eq!(state.next_attempt_at_ms, 100);
        assert!(!state.ready(50));
        assert!(state.ready(100));
    }

    #[test]
    fn retry_exhaustion_advances_to_next_provider() {
        let mut chain = three_provider_chain();
        let policy = policy(10, 1_000, 0.0);
        let mut rng = SmallRng::seed_from_u64(0);
        let mut state = RecoveryState::start(&mut chain, 0);

        for _ in 0..4 {
            state.on_failure(
                &ProviderError::ServerError("500".into()),
                &policy,
                &mut chain,
                0,
                &mut rng,
            );
        }
        // Three retries burned, fourth failure advances.
        assert_eq!(state.provider_idx, 1);
        assert_eq!(state.retries, 0);
    }

    #[test]
    fn fatal_error_advances_immediately_without_retry() {
        let mut chain = three_provider_chain();
        let policy = policy(10, 1_000, 0.0);
        let mut rng = SmallRng::seed_from_u64(0);
        let mut state = RecoveryState::start(&mut chain, 0);

        state.on_failure(
            &ProviderError::AuthFailed("bad key".into()),
            &policy,
            &mut chain,
            0,
            &mut rng,
        );
        assert_eq!(state.provider_idx, 1);
        assert_eq!(state.next_attempt_at_ms, 0);
    }

    #[test]
    fn chain_terminates_at_offline_provider() {
        let mut chain = three_provider_chain();
        let policy = policy(10, 1_000, 0.0);
        let mut rng = SmallRng::seed_from_u64(0);
        let mut state = RecoveryState::start(&mut chain, 0);

        // Fatal errors walk the whole chain.
        state.on_failure(
            &ProviderError::BadRequest("x".into()),
            &policy,
            &mut chain,
            0,
            &mut rng,
        );
        state.on_failure(
            &ProviderError::BadRequest("x".into()),
            &policy,
            &mut chain,
            0,
            &mut rng,
        );
        assert_eq!(state.provider_idx, chain.terminal_index());
    }
}
