//! Retry with bounded exponential backoff
//!
//! Wraps a single provider operation. Transient failures (rate limit,
//! network, timeout, transient API error) are retried with exponential
//! backoff plus jitter; everything else short-circuits on the first
//! attempt so the fallback coordinator can decide what to do next.
//!
//! **Algorithm:**
//! 1. Attempt operation
//! 2. If successful, return value with attempt count
//! 3. If failure is retryable and budget remains: log WARN, backoff, retry
//! 4. If failure is terminal or budget exhausted: return structured failure
//!
//! Exhaustion is a value, never a panic; callers make switching
//! decisions without exception-based control flow.

use pageweave_common::config::RetryConfig;
use pageweave_common::error::ProviderError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Jitter bounds: ±25% multiplicative, uniform
const JITTER_LOW: f64 = 0.75;
const JITTER_HIGH: f64 = 1.25;

/// Classification seam between the retry loop and its error type.
///
/// The executor never inspects error text; it asks the error whether
/// waiting and trying again can possibly help.
pub trait RetryClass {
    fn is_retryable(&self) -> bool;
}

impl RetryClass for ProviderError {
    fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// One failed attempt in the history of a retry invocation
#[derive(Debug, Clone)]
pub struct RetryAttempt<E> {
    /// 1-indexed attempt number
    pub attempt: u32,
    /// Backoff applied after this attempt (zero for the last one)
    pub delay: Duration,
    pub error: E,
}

/// Structured failure after retries stop
#[derive(Debug, Clone)]
pub struct RetryFailure<E> {
    pub last_error: E,
    /// Total attempts made, including the first
    pub attempts: u32,
    /// Sum of all backoff sleeps actually applied
    pub total_delay: Duration,
    /// Per-attempt history for diagnostics
    pub log: Vec<RetryAttempt<E>>,
}

/// Outcome of one `execute` invocation
#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    Success { value: T, attempts: u32 },
    Exhausted(RetryFailure<E>),
}

impl<T, E> RetryOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Success { .. })
    }
}

/// Executes one asynchronous operation with bounded backoff
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Base backoff for a 1-indexed attempt, before jitter:
    /// `min(initial * multiplier^(n-1), max)`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw =
            self.config.initial_delay_ms as f64 * self.config.backoff_multiplier.powi(exponent);
        Duration::from_millis(raw.min(self.config.max_delay_ms as f64) as u64)
    }

    /// Backoff with ±25% multiplicative jitter applied, floored at zero
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let factor = rand::thread_rng().gen_range(JITTER_LOW..=JITTER_HIGH);
        Duration::from_millis((base * factor).max(0.0) as u64)
    }

    /// Run `operation` until it succeeds, fails terminally, or the
    /// retry budget (`max_retries` after the first attempt) runs out.
    pub async fn execute<F, Fut, T, E>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryClass + Clone + std::fmt::Display,
    {
        let max_attempts = self.config.max_retries + 1;
        let mut log = Vec::new();
        let mut total_delay = Duration::ZERO;

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                debug!(operation = operation_name, attempt, "Retrying operation");
            }

            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(
                            operation = operation_name,
                            attempt, "Operation succeeded after retry"
                        );
                    }
                    return RetryOutcome::Success {
                        value,
                        attempts: attempt,
                    };
                }
                Err(err) if !err.is_retryable() => {
                    debug!(
                        operation = operation_name,
                        attempt,
                        error = %err,
                        "Terminal error, not retrying"
                    );
                    log.push(RetryAttempt {
                        attempt,
                        delay: Duration::ZERO,
                        error: err.clone(),
                    });
                    return RetryOutcome::Exhausted(RetryFailure {
                        last_error: err,
                        attempts: attempt,
                        total_delay,
                        log,
                    });
                }
                Err(err) if attempt == max_attempts => {
                    warn!(
                        operation = operation_name,
                        attempt,
                        error = %err,
                        "Retries exhausted"
                    );
                    log.push(RetryAttempt {
                        attempt,
                        delay: Duration::ZERO,
                        error: err.clone(),
                    });
                    return RetryOutcome::Exhausted(RetryFailure {
                        last_error: err,
                        attempts: attempt,
                        total_delay,
                        log,
                    });
                }
                Err(err) => {
                    let delay = self.jittered_delay(attempt);
                    warn!(
                        operation = operation_name,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "Transient failure, will retry after backoff"
                    );
                    log.push(RetryAttempt {
                        attempt,
                        delay,
                        error: err,
                    });
                    total_delay += delay;
                    tokio::time::sleep(delay).await;
                }
            }
        }
        unreachable!("loop returns on success, terminal error, or final attempt")
    }
}
