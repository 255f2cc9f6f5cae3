//! The relay: a single context object composing queue, limiter, cache,
//! failover chain, recovery, replay log, and usage tracker.
//!
//! Hosts construct one [`LlmRelay`] per run (no process-wide globals; tests
//! build a fresh, isolated instance each), call
//! [`submit`](LlmRelay::submit) from their decision/narrative modules, and
//! drive everything from the game loop with [`pump`](LlmRelay::pump). No
//! relay operation blocks the pump thread; completions are always delivered
//! through the stored continuation during a later pump.

use error_stack::Report;
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::cache::{CacheStats, CachedResponse, ResponseCache, cache_key};
use crate::clock::{SharedClock, SystemClock};
use crate::config::{ConfigError, RelayConfig};
use crate::dispatch::{CallJob, Dispatcher, InlineDispatcher};
use crate::error::{RelayError, RelayResult};
use crate::failover::{FailoverChain, ProviderHealth};
use crate::limiter::TokenBucket;
use crate::provider::{OfflineProvider, SharedProvider};
use crate::queue::{RequestQueue, SubmitError};
use crate::recovery::{RecoveryState, RetryPolicy};
use crate::replay::{
    DivergencePoint, ReplayError, ReplayLog, ReplayLogEntry, ReplayMode, ReplayValidator,
};
use crate::request::{Completion, OnComplete, Prompt, Request, ServedFrom, Tier};
use crate::usage::{BudgetAlert, UsageReport, UsageTotals, UsageTracker};

/// Counters for one pump, for host-side observability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub tick: u64,
    /// Continuations fired with content this pump.
    pub delivered: usize,
    /// Continuations fired with a terminal timeout this pump.
    pub timed_out: usize,
    /// Provider attempts handed to the dispatcher this pump.
    pub dispatched: usize,
    pub cache_hits: usize,
    pub replay_hits: usize,
    /// Divergences recorded by the tolerant validator this pump.
    pub divergences: usize,
}

/// Builder for [`LlmRelay`].
pub struct RelayBuilder {
    config: RelayConfig,
    clock: Option<SharedClock>,
    dispatcher: Option<Box<dyn Dispatcher>>,
    providers: Vec<SharedProvider>,
    replay_log: Option<ReplayLog>,
    tolerant_replay: bool,
}

impl RelayBuilder {
    fn new(config: RelayConfig) -> Self {
        Self {
            config,
            clock: None,
            dispatcher: None,
            providers: Vec::new(),
            replay_log: None,
            tolerant_replay: false,
        }
    }

    /// Override the wall clock (tests use a manual clock).
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Override the dispatcher (defaults to [`InlineDispatcher`]).
    pub fn dispatcher(mut self, dispatcher: Box<dyn Dispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    /// Append a provider to the failover chain, in priority order. The
    /// deterministic offline fallback is always appended last automatically;
    /// do not add a terminal fallback yourself.
    pub fn provider(mut self, provider: SharedProvider) -> Self {
        self.providers.push(provider);
        self
    }

    /// Use a preloaded replay log instead of reading one from
    /// `config.replay.log_path` (in-memory record/replay round trips).
    pub fn replay_log(mut self, log: ReplayLog) -> Self {
        self.replay_log = Some(log);
        self
    }

    /// Opt into tolerant validation: divergences are counted and the
    /// offending calls fall through to the live path instead of halting.
    pub fn tolerant_replay(mut self) -> Self {
        self.tolerant_replay = true;
        self
    }

    pub fn build(self) -> RelayResult<LlmRelay> {
        self.config
            .validate()
            .map_err(RelayError::from)
            .map_err(Report::new)?;

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock) as SharedClock);
        let dispatcher = self
            .dispatcher
            .unwrap_or_else(|| Box::new(InlineDispatcher::new()));

        let replay = match self.replay_log {
            Some(log) => log,
            None => match self.config.replay.mode {
                ReplayMode::Record => ReplayLog::record(),
                ReplayMode::Replay => {
                    let path = self
                        .config
                        .replay
                        .log_path
                        .as_ref()
                        .ok_or_else(|| Report::new(RelayError::Config(ConfigError::MissingReplayLog)))?;
                    ReplayLog::load(path)?
                }
            },
        };
        let replay_mode = replay.mode();
        info!(mode = ?replay_mode, providers = self.providers.len() + 1, "relay initialized");

        let mut providers = self.providers;
        providers.push(Arc::new(OfflineProvider::new()) as SharedProvider);
        let chain = FailoverChain::new(providers, self.config.failover);

        let queue = RequestQueue::new(self.config.queue);
        let limiter = TokenBucket::new(self.config.limiter, clock.clone());
        let cache = ResponseCache::new(self.config.cache, clock.clone());
        let usage = UsageTracker::new(
            self.config.pricing.clone(),
            &self.config.budget,
            clock.clone(),
        );
        let policy = RetryPolicy::new(self.config.retry);
        let rng = SmallRng::seed_from_u64(self.config.rng_seed);

        Ok(LlmRelay {
            validator: (replay_mode == ReplayMode::Replay && self.tolerant_replay)
                .then(ReplayValidator::new),
            config: self.config,
            clock,
            queue,
            limiter,
            cache,
            chain,
            policy,
            replay,
            usage,
            dispatcher,
            in_flight: HashMap::new(),
            rng,
            tick: 0,
            halted: None,
            alerts: Vec::new(),
        })
    }
}

struct InFlightCall {
    request: Request,
    recovery: RecoveryState,
}

/// The request-orchestration context object.
pub struct LlmRelay {
    config: RelayConfig,
    clock: SharedClock,
    queue: RequestQueue,
    limiter: TokenBucket,
    cache: ResponseCache,
    chain: FailoverChain,
    policy: RetryPolicy,
    replay: ReplayLog,
    /// Present only in tolerant replay runs.
    validator: Option<ReplayValidator>,
    usage: UsageTracker,
    dispatcher: Box<dyn Dispatcher>,
    in_flight: HashMap<Uuid, InFlightCall>,
    rng: SmallRng,
    tick: u64,
    /// Set on a strict-replay divergence; every later pump fails fast.
    halted: Option<DivergencePoint>,
    alerts: Vec<BudgetAlert>,
}

impl LlmRelay {
    pub fn builder(config: RelayConfig) -> RelayBuilder {
        RelayBuilder::new(config)
    }

    /// A relay with default clock and inline dispatcher and no live
    /// providers (offline fallback only).
    pub fn new(config: RelayConfig) -> RelayResult<Self> {
        Self::builder(config).build()
    }

    /// Submit a request. Admission failures (`QueueFull`,
    /// `DuplicateRequest`) are returned synchronously and the continuation
    /// is not consumed; the caller decides whether to resubmit. Once
    /// admitted, the continuation fires exactly once on a later pump.
    pub fn submit<F>(
        &mut self,
        tier: Tier,
        call_type: impl Into<String>,
        prompt: Prompt,
        on_complete: F,
    ) -> Result<Uuid, SubmitError>
    where
        F: FnOnce(Completion) + Send + 'static,
    {
        let call_type = call_type.into();
        let key = cache_key(&call_type, &prompt);
        self.queue.can_admit(tier, &call_type, &key)?;

        // Reserved only after admission, so rejected submissions leave the
        // replay numbering untouched.
        let replay_sequence = self.replay.reserve(self.tick, &call_type);
        let deadline_ms = self.clock.now_millis() + self.config.queue.tier(tier).deadline_ms;
        let request = Request::new(
            tier,
            call_type,
            prompt,
            self.tick,
            deadline_ms,
            key,
            replay_sequence,
            Box::new(on_complete) as OnComplete,
        );
        let id = request.id;
        debug!(request_id = %id, %tier, call_type = %request.call_type, "request admitted");
        self.queue.push(request);
        Ok(id)
    }

    /// Advance the relay by one cooperative step.
    ///
    /// Order of operations: deliver finished provider attempts, cancel
    /// elapsed deadlines, advance backoff/failover for waiting calls, then
    /// dispatch from the queue (replay → cache → rate limiter → providers).
    pub fn pump(&mut self, tick: u64) -> RelayResult<PumpReport> {
        self.tick = tick;
        if let Some(point) = &self.halted {
            return Err(Report::new(RelayError::Replay(ReplayError::Divergence {
                tick: point.tick,
                call_type: point.call_type.clone(),
                sequence: point.sequence,
            }))
            .attach("replay session halted by earlier divergence"));
        }

        let mut report = PumpReport {
            tick,
            ..PumpReport::default()
        };
        let now = self.clock.now_millis();

        self.collect_results(now, &mut report);
        self.cancel_elapsed(now, &mut report);
        self.advance_waiting(now, &mut report);
        self.dispatch_pending(now, &mut report)?;

        Ok(report)
    }

    /// Deliver results the dispatcher has finished since the last pump.
    fn collect_results(&mut self, now: u64, report: &mut PumpReport) {
        for result in self.dispatcher.poll() {
            let Some(mut call) = self.in_flight.remove(&result.call_id) else {
                // Deadline cancellation already discarded this call; the
                // late result is dropped per the advisory-cancel contract.
                debug!(call_id = %result.call_id, "discarding result for cancelled call");
                continue;
            };
            match result.outcome {
                Ok(response) => {
                    self.chain.record_success(call.recovery.provider_idx, now);
                    let served = if call.recovery.provider_idx == self.chain.terminal_index() {
                        ServedFrom::Fallback
                    } else {
                        ServedFrom::Provider
                    };
                    let tokens_used = response.total_tokens();
                    self.finish_success(
                        call.request,
                        response.content,
                        &response.model,
                        (response.input_tokens, response.completion_tokens),
                        tokens_used,
                        served,
                        result.duration_ms,
                        report,
                    );
                }
                Err(provider_error) => {
                    call.recovery.on_failure(
                        &provider_error,
                        &self.policy,
                        &mut self.chain,
                        now,
                        &mut self.rng,
                    );
                    self.in_flight.insert(result.call_id, call);
                }
            }
        }
    }

    /// Fire timeout continuations for every request past its deadline,
    /// pending or in flight.
    fn cancel_elapsed(&mut self, now: u64, report: &mut PumpReport) {
        for request in self.queue.expire(now) {
            report.timed_out += 1;
            self.fire_timeout(request);
        }

        let elapsed: Vec<Uuid> = self
            .in_flight
            .iter()
            .filter(|(_, call)| call.request.deadline_ms <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in elapsed {
            // In-flight cancellation is advisory: the dispatched attempt may
            // still finish, and its result is discarded in collect_results.
            if let Some(call) = self.in_flight.remove(&id) {
                self.queue.mark_complete(call.request.tier);
                report.timed_out += 1;
                self.fire_timeout(call.request);
            }
        }
    }

    fn fire_timeout(&self, request: Request) {
        warn!(
            request_id = %request.id,
            tier = %request.tier,
            call_type = %request.call_type,
            "deadline elapsed, cancelling request"
        );
        let completion = Completion::failed(
            request.id,
            request.call_type.clone(),
            format!("deadline elapsed after {} ms", self.config.queue.tier(request.tier).deadline_ms),
        );
        request.complete(completion);
    }

    /// Dispatch retries/failover advances whose backoff delay has passed.
    fn advance_waiting(&mut self, now: u64, report: &mut PumpReport) {
        for call in self.in_flight.values_mut() {
            if !call.recovery.ready(now) {
                continue;
            }
            // A backoff retry stays on the provider it was scheduled for;
            // health-based skipping only applies when the chain advances.
            let provider = self.chain.provider(call.recovery.provider_idx).clone();
            call.recovery.awaiting_result = true;
            report.dispatched += 1;
            self.dispatcher.dispatch(CallJob {
                call_id: call.request.id,
                provider,
                call_type: call.request.call_type.clone(),
                prompt: call.request.prompt.clone(),
            });
        }
    }

    /// Pull from the queue: replay lookup first, then cache, then the rate
    /// limiter gate, then a fresh recovery cycle against the chain.
    fn dispatch_pending(&mut self, now: u64, report: &mut PumpReport) -> RelayResult<()> {
        while let Some(request) = self.queue.dequeue() {
            if self.replay.mode() == ReplayMode::Replay {
                match self.replay.lookup_at(
                    request.submitted_at_tick,
                    &request.call_type,
                    request.replay_sequence,
                    &request.normalized_key,
                ) {
                    Ok(entry) => {
                        self.serve_replay_hit(request, entry, report);
                        continue;
                    }
                    Err(ReplayError::Divergence {
                        tick,
                        call_type,
                        sequence,
                    }) => {
                        let point = DivergencePoint {
                            tick,
                            call_type,
                            sequence,
                        };
                        if let Some(validator) = &mut self.validator {
                            warn!(
                                tick = point.tick,
                                call_type = %point.call_type,
                                sequence = point.sequence,
                                "replay divergence (tolerant): serving live"
                            );
                            validator.record(point);
                            report.divergences += 1;
                            // Fall through to the live path below.
                        } else {
                            error!(
                                tick = point.tick,
                                call_type = %point.call_type,
                                sequence = point.sequence,
                                "replay divergence: halting session"
                            );
                            self.queue.mark_complete(request.tier);
                            let completion = Completion::failed(
                                request.id,
                                request.call_type.clone(),
                                ReplayError::Divergence {
                                    tick: point.tick,
                                    call_type: point.call_type.clone(),
                                    sequence: point.sequence,
                                }
                                .to_string(),
                            );
                            request.complete(completion);
                            let err = ReplayError::Divergence {
                                tick: point.tick,
                                call_type: point.call_type.clone(),
                                sequence: point.sequence,
                            };
                            self.halted = Some(point);
                            return Err(Report::new(RelayError::Replay(err)));
                        }
                    }
                    Err(other) => {
                        self.queue.requeue_front(request);
                        return Err(Report::new(RelayError::Replay(other)));
                    }
                }
            }

            if let Some(cached) = self.cache.get(&request.normalized_key) {
                report.cache_hits += 1;
                let model = cached.model.clone();
                self.finish_success(
                    request,
                    cached.content,
                    &model,
                    (0, 0), // cache hits bill nothing
                    cached.tokens_used,
                    ServedFrom::Cache,
                    0,
                    report,
                );
                continue;
            }

            // The admission gate applies to every live dispatch, whatever
            // the tier. The bucket is global, so once it is empty nothing
            // lower-priority can dispatch either: put the request back and
            // stop pulling.
            if !self.limiter.try_acquire() {
                debug!(
                    wait_secs = self.limiter.wait_time_secs(),
                    "rate limiter empty, deferring dispatch"
                );
                self.queue.requeue_front(request);
                break;
            }

            let recovery = RecoveryState::start(&mut self.chain, now);
            let provider = self.chain.provider(recovery.provider_idx).clone();
            let mut call = InFlightCall { request, recovery };
            call.recovery.awaiting_result = true;
            report.dispatched += 1;
            self.dispatcher.dispatch(CallJob {
                call_id: call.request.id,
                provider,
                call_type: call.request.call_type.clone(),
                prompt: call.request.prompt.clone(),
            });
            self.in_flight.insert(call.request.id, call);
        }
        Ok(())
    }

    fn serve_replay_hit(&mut self, request: Request, entry: ReplayLogEntry, report: &mut PumpReport) {
        // Replayed calls are still ledger entries, but bill nothing.
        let (_, alerts) = self.usage.record("replay", &request.call_type, 0, 0);
        self.alerts.extend(alerts);
        self.queue.mark_complete(request.tier);
        report.delivered += 1;
        report.replay_hits += 1;
        let completion = Completion::served(
            request.id,
            request.call_type.clone(),
            entry.output,
            entry.tokens_used,
            0.0,
            ServedFrom::Replay,
        );
        request.complete(completion);
    }

    /// Common completion path for provider, fallback, and cache results.
    #[allow(clippy::too_many_arguments)]
    fn finish_success(
        &mut self,
        request: Request,
        content: String,
        model: &str,
        billed_tokens: (u32, u32),
        tokens_used: u32,
        served: ServedFrom,
        duration_ms: u64,
        report: &mut PumpReport,
    ) {
        let (cost, alerts) =
            self.usage
                .record(model, &request.call_type, billed_tokens.0, billed_tokens.1);
        self.alerts.extend(alerts);

        if matches!(served, ServedFrom::Provider | ServedFrom::Fallback) {
            self.cache.put(
                request.normalized_key.clone(),
                CachedResponse {
                    content: content.clone(),
                    model: model.to_string(),
                    tokens_used,
                },
                self.config.cache.ttl_ms,
            );
        }

        if self.replay.mode() == ReplayMode::Record {
            // Errors only on a mode mismatch, which we just excluded.
            let _ = self.replay.append_at(
                request.submitted_at_tick,
                &request.call_type,
                request.replay_sequence,
                &request.normalized_key,
                &content,
                tokens_used,
                duration_ms,
            );
        }

        self.queue.mark_complete(request.tier);
        report.delivered += 1;
        debug!(
            request_id = %request.id,
            %served,
            cost_usd = cost,
            tokens = tokens_used,
            "request completed"
        );
        let completion = Completion::served(
            request.id,
            request.call_type.clone(),
            content,
            tokens_used,
            cost,
            served,
        );
        request.complete(completion);
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    /// Advisory flag: any live provider currently degraded or down.
    pub fn degraded_mode(&self) -> bool {
        self.chain.degraded_mode()
    }

    pub fn provider_health(&self) -> Vec<ProviderHealth> {
        self.chain.health_snapshot()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn usage_totals(&self) -> UsageTotals {
        self.usage.totals()
    }

    pub fn usage_report(&self) -> UsageReport {
        self.usage.report()
    }

    /// Budget alerts raised since the last call. Advisory only.
    pub fn take_alerts(&mut self) -> Vec<BudgetAlert> {
        std::mem::take(&mut self.alerts)
    }

    /// Divergence statistics, present only in tolerant replay runs.
    pub fn replay_validation(&self) -> Option<&ReplayValidator> {
        self.validator.as_ref()
    }

    /// Entries recorded (or loaded) so far.
    pub fn replay_entries(&self) -> &[ReplayLogEntry] {
        self.replay.entries()
    }

    /// Persist the replay log to `config.replay.log_path`.
    pub fn flush_replay_log(&self) -> RelayResult<()> {
        match &self.config.replay.log_path {
            Some(path) => self.replay.flush_to(path),
            None => Err(Report::new(RelayError::Internal(
                "replay.log_path not configured".into(),
            ))),
        }
    }

    pub fn pending_len(&self, tier: Tier) -> usize {
        self.queue.pending_len(tier)
    }

    pub fn in_flight_len(&self, tier: Tier) -> usize {
        self.queue.in_flight(tier)
    }
}
