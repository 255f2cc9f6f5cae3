//! Usage tracking: per-call cost ledger, hour/day aggregation, and advisory
//! budget alerts.
//!
//! The tracker is append-only and purely observational — it never blocks or
//! denies a request. Crossing a configured cost threshold raises a
//! [`BudgetAlert`] exactly once per threshold level.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::warn;

use crate::clock::SharedClock;
use crate::config::BudgetConfig;

/// Per-model pricing, USD per 1,000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_cost_per_1k_tokens: f64,
    pub completion_cost_per_1k_tokens: f64,
}

impl ModelPricing {
    pub fn new(input_per_1k: f64, completion_per_1k: f64) -> Self {
        Self {
            input_cost_per_1k_tokens: input_per_1k,
            completion_cost_per_1k_tokens: completion_per_1k,
        }
    }

    /// Zero-cost pricing, used for the offline fallback and replay hits.
    pub fn free() -> Self {
        Self::new(0.0, 0.0)
    }

    pub fn calculate_cost(&self, input_tokens: u32, completion_tokens: u32) -> f64 {
        (input_tokens as f64 / 1000.0) * self.input_cost_per_1k_tokens
            + (completion_tokens as f64 / 1000.0) * self.completion_cost_per_1k_tokens
    }
}

/// Registry of model pricing, keyed by the model name providers report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingTable {
    rates: HashMap<String, ModelPricing>,
}

impl PricingTable {
    pub fn empty() -> Self {
        Self {
            rates: HashMap::new(),
        }
    }

    /// The offline fallback and replay pseudo-models are always free.
    pub fn with_defaults() -> Self {
        let mut table = Self::empty();
        table.register("offline", ModelPricing::free());
        table.register("replay", ModelPricing::free());
        table
    }

    pub fn register(&mut self, model: impl Into<String>, pricing: ModelPricing) {
        self.rates.insert(model.into(), pricing);
    }

    pub fn with_model(mut self, model: impl Into<String>, pricing: ModelPricing) -> Self {
        self.register(model, pricing);
        self
    }

    pub fn get(&self, model: &str) -> Option<ModelPricing> {
        self.rates.get(model).copied()
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// One ledger line. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp_ms: u64,
    pub model: String,
    pub call_type: String,
    pub input_tokens: u32,
    pub completion_tokens: u32,
    pub cost_usd: f64,
}

/// Running totals for one aggregation bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub calls: u64,
    pub input_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
}

impl UsageTotals {
    fn add(&mut self, record: &UsageRecord) {
        self.calls += 1;
        self.input_tokens += u64::from(record.input_tokens);
        self.completion_tokens += u64::from(record.completion_tokens);
        self.cost_usd += record.cost_usd;
    }
}

/// Raised (as an observation only) when cumulative cost crosses a threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetAlert {
    pub threshold_usd: f64,
    pub cumulative_usd: f64,
    pub at_ms: u64,
}

/// Flat, exportable usage report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageReport {
    pub generated_at_ms: u64,
    pub totals: UsageTotals,
    pub by_model_call: BTreeMap<String, UsageTotals>,
    pub by_day: BTreeMap<String, UsageTotals>,
    pub by_hour: BTreeMap<String, UsageTotals>,
}

impl std::fmt::Display for UsageReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "usage: {} calls, {} in / {} out tokens, ${:.4}",
            self.totals.calls,
            self.totals.input_tokens,
            self.totals.completion_tokens,
            self.totals.cost_usd
        )?;
        for (key, totals) in &self.by_model_call {
            writeln!(
                f,
                "  {key:<40} {:>6} calls  ${:.4}",
                totals.calls, totals.cost_usd
            )?;
        }
        for (day, totals) in &self.by_day {
            writeln!(f, "  {day}: {} calls, ${:.4}", totals.calls, totals.cost_usd)?;
        }
        Ok(())
    }
}

/// Append-only cost/token ledger.
pub struct UsageTracker {
    pricing: PricingTable,
    records: Vec<UsageRecord>,
    totals: UsageTotals,
    by_model_call: BTreeMap<String, UsageTotals>,
    by_day: BTreeMap<String, UsageTotals>,
    by_hour: BTreeMap<String, UsageTotals>,
    thresholds: Vec<f64>,
    fired: Vec<bool>,
    clock: SharedClock,
}

impl UsageTracker {
    pub fn new(pricing: PricingTable, budget: &BudgetConfig, clock: SharedClock) -> Self {
        let mut thresholds = budget.thresholds_usd.clone();
        thresholds.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let fired = vec![false; thresholds.len()];
        Self {
            pricing,
            records: Vec::new(),
            totals: UsageTotals::default(),
            by_model_call: BTreeMap::new(),
            by_day: BTreeMap::new(),
            by_hour: BTreeMap::new(),
            thresholds,
            fired,
            clock,
        }
    }

    /// Append a usage record. Returns the computed cost plus any budget
    /// alerts the record pushed the cumulative total across.
    pub fn record(
        &mut self,
        model: &str,
        call_type: &str,
        input_tokens: u32,
        completion_tokens: u32,
    ) -> (f64, Vec<BudgetAlert>) {
        let pricing = self.pricing.get(model).unwrap_or_else(|| {
            warn!(model, "no pricing registered for model, counting as free");
            ModelPricing::free()
        });
        let cost = pricing.calculate_cost(input_tokens, completion_tokens);
        let now = self.clock.now_millis();

        let record = UsageRecord {
            timestamp_ms: now,
            model: model.to_string(),
            call_type: call_type.to_string(),
            input_tokens,
            completion_tokens,
            cost_usd: cost,
        };

        self.totals.add(&record);
        self.by_model_call
            .entry(format!("{model}/{call_type}"))
            .or_default()
            .add(&record);
        if let Some(ts) = DateTime::<Utc>::from_timestamp_millis(now as i64) {
            self.by_day
                .entry(ts.format("%Y-%m-%d").to_string())
                .or_default()
                .add(&record);
            self.by_hour
                .entry(ts.format("%Y-%m-%dT%H").to_string())
                .or_default()
                .add(&record);
        }
        self.records.push(record);

        let mut alerts = Vec::new();
        for (idx, threshold) in self.thresholds.iter().enumerate() {
            if !self.fired[idx] && self.totals.cost_usd >= *threshold {
                self.fired[idx] = true;
                warn!(
                    threshold_usd = *threshold,
                    cumulative_usd = self.totals.cost_usd,
                    "budget threshold crossed"
                );
                alerts.push(BudgetAlert {
                    threshold_usd: *threshold,
                    cumulative_usd: self.totals.cost_usd,
                    at_ms: now,
                });
            }
        }
        (cost, alerts)
    }

    pub fn totals(&self) -> UsageTotals {
        self.totals
    }

    pub fn records(&self) -> &[UsageRecord] {
        &self.records
    }

    /// Build the exportable flat report.
    pub fn report(&self) -> UsageReport {
        UsageReport {
            generated_at_ms: self.clock.now_millis(),
            totals: self.totals,
            by_model_call: self.by_model_call.clone(),
            by_day: self.by_day.clone(),
            by_hour: self.by_hour.clone(),
        }
    }
}
