//! Token and cost accounting
//!
//! Accumulates prompt/completion token counts per provider and derives
//! a running cost estimate from per-million-token rates. Addition is
//! the only mutation; `reset()` zeroes everything. The ledger is an
//! explicitly constructed instance owned by its job, never a global,
//! so concurrent jobs bill independently.

use pageweave_common::provider::TokenUsage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Cost rates for one provider, dollars per million tokens
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CostRates {
    pub prompt_per_million: f64,
    pub completion_per_million: f64,
}

/// Accumulated counters for one provider
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProviderUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub calls: u64,
    pub estimated_cost: f64,
}

/// Point-in-time snapshot of the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub estimated_cost: f64,
    pub by_provider: HashMap<String, ProviderUsage>,
}

/// Accumulates usage across every successful provider call in a job
#[derive(Debug, Default)]
pub struct UsageLedger {
    rates: HashMap<String, CostRates>,
    by_provider: HashMap<String, ProviderUsage>,
}

impl UsageLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register cost rates for a provider. Unregistered providers
    /// accumulate tokens with a zero cost estimate.
    pub fn set_rates(&mut self, provider_id: impl Into<String>, rates: CostRates) {
        self.rates.insert(provider_id.into(), rates);
    }

    /// Record one successful call's token usage
    pub fn record(&mut self, provider_id: &str, usage: TokenUsage) {
        let rates = self.rates.get(provider_id).copied().unwrap_or_default();
        let cost = usage.prompt_tokens as f64 / 1_000_000.0 * rates.prompt_per_million
            + usage.completion_tokens as f64 / 1_000_000.0 * rates.completion_per_million;

        let entry = self.by_provider.entry(provider_id.to_string()).or_default();
        entry.prompt_tokens += usage.prompt_tokens;
        entry.completion_tokens += usage.completion_tokens;
        entry.calls += 1;
        entry.estimated_cost += cost;
    }

    /// Snapshot of all counters
    pub fn snapshot(&self) -> UsageRecord {
        let mut prompt = 0;
        let mut completion = 0;
        let mut cost = 0.0;
        for usage in self.by_provider.values() {
            prompt += usage.prompt_tokens;
            completion += usage.completion_tokens;
            cost += usage.estimated_cost;
        }
        UsageRecord {
            prompt_tokens: prompt,
            completion_tokens: completion,
            estimated_cost: cost,
            by_provider: self.by_provider.clone(),
        }
    }

    /// Zero all counters; registered rates survive
    pub fn reset(&mut self) {
        self.by_provider.clear();
    }
}
