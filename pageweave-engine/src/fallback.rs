//! Provider failover
//!
//! Executes an operation against an ordered provider list. The retry
//! executor always runs first against the current provider; only after
//! local retries exhaust does the coordinator consider switching, and
//! only when the failure kind warrants it (rate limiting, bad
//! credentials, an open breaker, or `switch_on_error`), the switch
//! budget allows it, and a usable alternate exists.
//!
//! Every provider attempt, successful or not, lands in an ordered
//! history returned to the caller for diagnostics.

use crate::breaker::CallFailure;
use crate::retry::{RetryExecutor, RetryOutcome};
use pageweave_common::config::FallbackConfig;
use pageweave_common::error::ErrorKind;
use pageweave_common::provider::ModelProvider;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Success-rate update factors (exponential, clamped)
const SUCCESS_RATE_GAIN: f64 = 1.1;
const FAILURE_RATE_DECAY: f64 = 0.9;

/// One provider's turn in a fallback execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAttempt {
    pub provider_id: String,
    /// Attempts the retry executor made against this provider
    pub attempts: u32,
    pub success: bool,
    /// Classified kind of the final error, when the turn failed.
    /// None for an open-breaker rejection (no provider call was made).
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

/// Successful fallback execution
#[derive(Debug)]
pub struct FallbackOutcome<T> {
    pub value: T,
    /// Provider that ultimately served the call
    pub provider_id: String,
    pub switches: u32,
    /// Total provider-call attempts across all providers
    pub total_attempts: u32,
    pub history: Vec<ProviderAttempt>,
}

/// All providers tried (or budget spent) without success
#[derive(Debug)]
pub struct FallbackFailure {
    pub last_error: CallFailure,
    pub switches: u32,
    /// Total provider-call attempts across all providers
    pub total_attempts: u32,
    pub history: Vec<ProviderAttempt>,
}

/// Priority weight and rolling success rate per registered provider.
///
/// Shared across jobs; the map is the only mutable state, behind a
/// `Mutex`. Score updates build a new value rather than adjusting in
/// place.
#[derive(Debug, Default)]
pub struct ProviderPriorityManager {
    entries: Mutex<HashMap<String, ProviderScore>>,
}

#[derive(Debug, Clone, Copy)]
struct ProviderScore {
    priority: f64,
    success_rate: f64,
}

impl ProviderPriorityManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider with its priority weight. Success rate
    /// starts at 1.0.
    pub fn register(&self, provider_id: impl Into<String>, priority: f64) {
        self.entries.lock().expect("priority mutex poisoned").insert(
            provider_id.into(),
            ProviderScore {
                priority,
                success_rate: 1.0,
            },
        );
    }

    pub fn record_success(&self, provider_id: &str) {
        self.update(provider_id, |score| ProviderScore {
            success_rate: (score.success_rate * SUCCESS_RATE_GAIN).min(1.0),
            ..score
        });
    }

    pub fn record_failure(&self, provider_id: &str) {
        self.update(provider_id, |score| ProviderScore {
            success_rate: (score.success_rate * FAILURE_RATE_DECAY).max(0.0),
            ..score
        });
    }

    fn update(&self, provider_id: &str, f: impl FnOnce(ProviderScore) -> ProviderScore) {
        let mut entries = self.entries.lock().expect("priority mutex poisoned");
        if let Some(score) = entries.get(provider_id).copied() {
            entries.insert(provider_id.to_string(), f(score));
        }
    }

    /// priority × success rate; unregistered providers score zero
    pub fn score(&self, provider_id: &str) -> f64 {
        self.entries
            .lock()
            .expect("priority mutex poisoned")
            .get(provider_id)
            .map(|s| s.priority * s.success_rate)
            .unwrap_or(0.0)
    }

    pub fn success_rate(&self, provider_id: &str) -> f64 {
        self.entries
            .lock()
            .expect("priority mutex poisoned")
            .get(provider_id)
            .map(|s| s.success_rate)
            .unwrap_or(0.0)
    }

    /// Order providers best-first by score, keeping only usable ones.
    /// Sort is stable, so equal scores preserve registration order.
    pub fn rank(&self, providers: &[Arc<dyn ModelProvider>]) -> Vec<Arc<dyn ModelProvider>> {
        let mut ranked: Vec<Arc<dyn ModelProvider>> = providers
            .iter()
            .filter(|p| p.is_usable())
            .cloned()
            .collect();
        ranked.sort_by(|a, b| {
            self.score(b.id())
                .partial_cmp(&self.score(a.id()))
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked
    }

    /// Best usable provider by score, if any
    pub fn best<'a>(
        &self,
        providers: &'a [Arc<dyn ModelProvider>],
    ) -> Option<&'a Arc<dyn ModelProvider>> {
        providers
            .iter()
            .filter(|p| p.is_usable())
            .max_by(|a, b| {
                self.score(a.id())
                    .partial_cmp(&self.score(b.id()))
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

/// Runs an operation across providers with retry and switch budgets
pub struct FallbackCoordinator {
    config: FallbackConfig,
    retry: RetryExecutor,
    priority: Arc<ProviderPriorityManager>,
}

impl FallbackCoordinator {
    pub fn new(
        config: FallbackConfig,
        retry: RetryExecutor,
        priority: Arc<ProviderPriorityManager>,
    ) -> Self {
        Self {
            config,
            retry,
            priority,
        }
    }

    /// Whether a post-retry failure justifies moving to another provider
    fn switch_qualifies(&self, failure: &CallFailure) -> bool {
        if self.config.switch_on_error {
            return true;
        }
        match failure {
            // The current provider's class is cooling down; an
            // alternate can serve the call right now.
            CallFailure::CircuitOpen { .. } => true,
            CallFailure::Provider(e) => match e.kind {
                ErrorKind::Authentication => true,
                ErrorKind::RateLimit => self.config.switch_on_rate_limit,
                _ => false,
            },
        }
    }

    /// Next usable provider scanning forward circularly from `current`,
    /// excluding `current` itself
    fn next_usable(
        providers: &[Arc<dyn ModelProvider>],
        current: usize,
    ) -> Option<usize> {
        (1..providers.len())
            .map(|offset| (current + offset) % providers.len())
            .find(|&i| providers[i].is_usable())
    }

    /// Execute `operation` against `providers`, starting at the first
    /// usable one and switching per policy. `operation` receives the
    /// provider for each turn (callers wrap it with their breaker).
    pub async fn execute<T, F, Fut>(
        &self,
        operation_name: &str,
        providers: &[Arc<dyn ModelProvider>],
        operation: F,
    ) -> Result<FallbackOutcome<T>, FallbackFailure>
    where
        F: Fn(Arc<dyn ModelProvider>) -> Fut,
        Fut: Future<Output = Result<T, CallFailure>>,
    {
        let mut history = Vec::new();
        let mut switches = 0u32;
        let mut total_attempts = 0u32;

        let Some(mut current) = providers.iter().position(|p| p.is_usable()) else {
            warn!(operation = operation_name, "No usable provider registered");
            return Err(FallbackFailure {
                last_error: CallFailure::Provider(pageweave_common::error::ProviderError::new(
                    ErrorKind::Unknown,
                    "no usable provider",
                )),
                switches: 0,
                total_attempts: 0,
                history,
            });
        };

        loop {
            let provider = providers[current].clone();
            let provider_id = provider.id().to_string();

            let outcome = self
                .retry
                .execute(operation_name, || operation(provider.clone()))
                .await;

            match outcome {
                RetryOutcome::Success { value, attempts } => {
                    total_attempts += attempts;
                    self.priority.record_success(&provider_id);
                    history.push(ProviderAttempt {
                        provider_id: provider_id.clone(),
                        attempts,
                        success: true,
                        error_kind: None,
                        error_message: None,
                    });
                    return Ok(FallbackOutcome {
                        value,
                        provider_id,
                        switches,
                        total_attempts,
                        history,
                    });
                }
                RetryOutcome::Exhausted(failure) => {
                    total_attempts += failure.attempts;
                    self.priority.record_failure(&provider_id);
                    let (kind, message) = match &failure.last_error {
                        CallFailure::Provider(e) => (Some(e.kind), e.message.clone()),
                        open @ CallFailure::CircuitOpen { .. } => (None, open.to_string()),
                    };
                    history.push(ProviderAttempt {
                        provider_id: provider_id.clone(),
                        attempts: failure.attempts,
                        success: false,
                        error_kind: kind,
                        error_message: Some(message),
                    });

                    let qualifies = self.switch_qualifies(&failure.last_error);
                    let next = Self::next_usable(providers, current);

                    match (qualifies, switches < self.config.max_switches, next) {
                        (true, true, Some(next_index)) => {
                            switches += 1;
                            info!(
                                operation = operation_name,
                                from = %provider_id,
                                to = %providers[next_index].id(),
                                switches,
                                "Switching provider after qualifying failure"
                            );
                            current = next_index;
                        }
                        _ => {
                            warn!(
                                operation = operation_name,
                                provider = %provider_id,
                                switches,
                                total_attempts,
                                qualifies,
                                "Fallback stopping without success"
                            );
                            return Err(FallbackFailure {
                                last_error: failure.last_error,
                                switches,
                                total_attempts,
                                history,
                            });
                        }
                    }
                }
            }
        }
    }
}
