//! # Cost Tracker
//!
//! Running token and spend totals for one run, shared by every worker of a
//! fan-out. Guardrail checks read the totals; only `record` writes them, and
//! totals only grow, so once a run reports `Exceeded` it stays there.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::GuardrailsConfig;
use crate::models::PriceTable;

/// Tri-state guardrail signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardrailStatus {
    Ok,
    Warning,
    Exceeded,
}

/// Snapshot of a tracker's totals
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSummary {
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub estimated_cost_usd: f64,
    pub total_calls: u64,
    pub calls_by_model: BTreeMap<String, u64>,
}

#[derive(Debug, Default)]
struct Totals {
    input_tokens: u64,
    output_tokens: u64,
    cost_usd: f64,
    calls: u64,
    calls_by_model: BTreeMap<String, u64>,
}

/// Thread-safe accumulator of model usage
#[derive(Debug)]
pub struct CostTracker {
    prices: PriceTable,
    guardrails: GuardrailsConfig,
    totals: Mutex<Totals>,
}

impl CostTracker {
    pub fn new(prices: PriceTable, guardrails: GuardrailsConfig) -> Self {
        Self {
            prices,
            guardrails,
            totals: Mutex::new(Totals::default()),
        }
    }

    /// Record one completed call
    pub fn record(&self, model: &str, input_tokens: u64, output_tokens: u64) {
        let cost = self.prices.price_for(model).cost(input_tokens, output_tokens);
        let mut totals = self.lock();
        totals.input_tokens += input_tokens;
        totals.output_tokens += output_tokens;
        totals.cost_usd += cost;
        totals.calls += 1;
        *totals.calls_by_model.entry(model.to_string()).or_insert(0) += 1;
    }

    pub fn check_guardrails(&self) -> GuardrailStatus {
        if !self.guardrails.enabled {
            return GuardrailStatus::Ok;
        }
        let totals = self.lock();
        if totals.cost_usd >= self.guardrails.max_cost_per_run_usd
            || totals.calls >= self.guardrails.max_sub_lm_calls
        {
            GuardrailStatus::Exceeded
        } else if totals.cost_usd >= self.guardrails.warn_cost_threshold_usd {
            GuardrailStatus::Warning
        } else {
            GuardrailStatus::Ok
        }
    }

    pub fn estimated_cost_usd(&self) -> f64 {
        self.lock().cost_usd
    }

    pub fn call_count(&self) -> u64 {
        self.lock().calls
    }

    pub fn summary(&self) -> CostSummary {
        let totals = self.lock();
        CostSummary {
            total_input_tokens: totals.input_tokens,
            total_output_tokens: totals.output_tokens,
            estimated_cost_usd: totals.cost_usd,
            total_calls: totals.calls,
            calls_by_model: totals.calls_by_model.clone(),
        }
    }

    // Bookkeeping can't leave totals half-updated, so a poisoned lock is still usable
    fn lock(&self) -> MutexGuard<'_, Totals> {
        self.totals.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
