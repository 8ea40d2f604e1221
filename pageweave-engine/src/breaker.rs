//! Circuit breaker for provider operation classes
//!
//! One breaker guards one operation class (e.g. "gemini/transcription"),
//! shared across retries, batches, and concurrent jobs. After
//! `failure_threshold` consecutive failures the breaker opens and
//! rejects calls immediately; once the cool-down elapses it admits
//! exactly one half-open trial call, closing on success and reopening
//! on failure. A trial whose future is dropped before resolving (a
//! stage timeout or a cancelled job) expires after another cool-down,
//! so an abandoned trial never wedges the class.
//!
//! State lives behind a `Mutex`; the breaker and the priority manager
//! are the only structures mutated by more than one job.

use pageweave_common::config::BreakerConfig;
use pageweave_common::error::ProviderError;
use crate::retry::RetryClass;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker state for one operation class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Calls pass through; consecutive failures are counted
    Closed,
    /// Calls rejected until the cool-down elapses
    Open,
    /// One trial call in flight; others rejected
    HalfOpen,
}

/// Failure of one guarded call: either the provider failed, or the
/// breaker rejected the call without issuing it.
#[derive(Debug, Clone, Error)]
pub enum CallFailure {
    #[error(transparent)]
    Provider(ProviderError),

    #[error("circuit open for class '{class}', retry after {} ms", remaining.as_millis())]
    CircuitOpen { class: String, remaining: Duration },
}

impl RetryClass for CallFailure {
    fn is_retryable(&self) -> bool {
        match self {
            CallFailure::Provider(e) => e.kind.is_retryable(),
            // Waiting out the cool-down locally would stall the stage;
            // the fallback coordinator handles open breakers instead.
            CallFailure::CircuitOpen { .. } => false,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    /// When the current half-open trial was admitted
    trial_started: Option<Instant>,
}

/// Per-operation-class failure tracker
#[derive(Debug)]
pub struct CircuitBreaker {
    class: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(class: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            class: class.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                trial_started: None,
            }),
        }
    }

    /// Current state, with the open→half-open transition applied if the
    /// cool-down has elapsed (read-only callers see the effective state).
    pub fn state(&self) -> CircuitState {
        let inner = self.inner.lock().expect("breaker mutex poisoned");
        match (inner.state, inner.last_failure) {
            (CircuitState::Open, Some(at))
                if at.elapsed() > Duration::from_millis(self.config.reset_timeout_ms) =>
            {
                CircuitState::HalfOpen
            }
            (state, _) => state,
        }
    }

    /// Admit or reject a call. On admission in the open state, the
    /// breaker moves to half-open and this caller owns the single
    /// trial; concurrent callers are rejected until the trial resolves.
    /// A trial that never resolves expires after `reset_timeout_ms`,
    /// and the next caller claims a fresh trial in its place.
    fn admit(&self) -> Result<(), CallFailure> {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                let expired = inner
                    .trial_started
                    .map(|at| at.elapsed() > Duration::from_millis(self.config.reset_timeout_ms))
                    .unwrap_or(true);
                if expired {
                    warn!(class = %self.class, "Half-open trial abandoned, admitting a new trial");
                    inner.trial_started = Some(Instant::now());
                    Ok(())
                } else {
                    Err(self.rejection(&inner))
                }
            }
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed > Duration::from_millis(self.config.reset_timeout_ms) {
                    info!(class = %self.class, "Circuit half-open, admitting trial call");
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_started = Some(Instant::now());
                    Ok(())
                } else {
                    Err(self.rejection(&inner))
                }
            }
        }
    }

    fn rejection(&self, inner: &BreakerInner) -> CallFailure {
        let remaining = inner
            .last_failure
            .map(|at| {
                Duration::from_millis(self.config.reset_timeout_ms).saturating_sub(at.elapsed())
            })
            .unwrap_or_default();
        CallFailure::CircuitOpen {
            class: self.class.clone(),
            remaining,
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        if inner.state == CircuitState::HalfOpen {
            info!(class = %self.class, "Trial call succeeded, circuit closed");
        }
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.trial_started = None;
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("breaker mutex poisoned");
        inner.last_failure = Some(Instant::now());
        inner.trial_started = None;
        match inner.state {
            CircuitState::HalfOpen => {
                warn!(class = %self.class, "Trial call failed, circuit reopened");
                inner.state = CircuitState::Open;
            }
            CircuitState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    warn!(
                        class = %self.class,
                        failures = inner.consecutive_failures,
                        "Failure threshold reached, circuit opened"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Run one call through the breaker: admit, execute, record.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T, CallFailure>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.admit()?;
        match operation().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                debug!(class = %self.class, kind = %err.kind, "Guarded call failed");
                Err(CallFailure::Provider(err))
            }
        }
    }
}

/// Lazily creates one breaker per operation class.
///
/// Shared across jobs; cloning shares the underlying map.
#[derive(Debug, Clone, Default)]
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Arc<Mutex<HashMap<String, Arc<CircuitBreaker>>>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Breaker for the given class, created on first use
    pub fn for_class(&self, class: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock().expect("registry mutex poisoned");
        breakers
            .entry(class.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(class, self.config.clone())))
            .clone()
    }
}
