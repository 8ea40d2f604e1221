//! Orchestrator configuration
//!
//! Tuning knobs for every layer of the call-orchestration engine,
//! resolved with ENV → TOML → compiled-default priority. All fields
//! carry serde defaults so a partial TOML file parses; environment
//! variables override individual keys for deploy-time tuning without
//! editing files.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Batch planning and pacing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Hard upper bound on items per provider call
    pub max_batch_size: usize,
    /// Fixed overlap width; None derives it from batch size (15%)
    pub overlap_size: Option<usize>,
    /// Pause between batches to respect provider rate limits
    pub delay_between_batches_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 20,
            overlap_size: None,
            delay_between_batches_ms: 1_000,
        }
    }
}

/// Retry executor tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt (total attempts = max_retries + 1)
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

/// Circuit breaker tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// Cool-down before a half-open trial call is allowed
    pub reset_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
        }
    }
}

/// Provider failover tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Maximum provider switches per operation
    pub max_switches: u32,
    /// Switch on any post-retry failure, not just qualifying kinds
    pub switch_on_error: bool,
    /// Switch when retries exhaust on rate limiting
    pub switch_on_rate_limit: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            max_switches: 2,
            switch_on_error: false,
            switch_on_rate_limit: true,
        }
    }
}

/// Stage pipeline tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Record a synthetic failure and keep going when a stage fails
    pub continue_on_error: bool,
    /// Skip stages that already have a successful result
    pub skip_completed: bool,
    /// Scales every stage's declared timeout
    pub timeout_multiplier: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            continue_on_error: false,
            skip_completed: true,
            timeout_multiplier: 1.0,
        }
    }
}

/// Complete orchestrator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub batch: BatchConfig,
    pub retry: RetryConfig,
    pub breaker: BreakerConfig,
    pub fallback: FallbackConfig,
    pub pipeline: PipelineConfig,
}

impl OrchestratorConfig {
    /// Load configuration with ENV → TOML → default priority.
    ///
    /// A missing file is not an error (defaults apply); a present but
    /// malformed file is, so misconfiguration fails loudly at startup
    /// rather than silently running with defaults.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) if path.exists() => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("failed to read {}: {}", path.display(), e))
                })?;
                let parsed: OrchestratorConfig = toml::from_str(&content).map_err(|e| {
                    Error::Config(format!("failed to parse {}: {}", path.display(), e))
                })?;
                info!(path = %path.display(), "Orchestrator config loaded from TOML");
                parsed
            }
            Some(path) => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                OrchestratorConfig::default()
            }
            None => OrchestratorConfig::default(),
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Overlay `PAGEWEAVE_*` environment variables onto loaded values.
    fn apply_env_overrides(&mut self) {
        override_usize("PAGEWEAVE_MAX_BATCH_SIZE", &mut self.batch.max_batch_size);
        override_u64(
            "PAGEWEAVE_DELAY_BETWEEN_BATCHES_MS",
            &mut self.batch.delay_between_batches_ms,
        );
        override_u32("PAGEWEAVE_MAX_RETRIES", &mut self.retry.max_retries);
        override_u64("PAGEWEAVE_INITIAL_DELAY_MS", &mut self.retry.initial_delay_ms);
        override_u64("PAGEWEAVE_MAX_DELAY_MS", &mut self.retry.max_delay_ms);
        override_u32(
            "PAGEWEAVE_FAILURE_THRESHOLD",
            &mut self.breaker.failure_threshold,
        );
        override_u64(
            "PAGEWEAVE_RESET_TIMEOUT_MS",
            &mut self.breaker.reset_timeout_ms,
        );
        override_u32("PAGEWEAVE_MAX_SWITCHES", &mut self.fallback.max_switches);
    }

    /// Reject combinations that would wedge or misplan the engine.
    pub fn validate(&self) -> Result<()> {
        if self.batch.max_batch_size < 2 {
            return Err(Error::Config(
                "batch.max_batch_size must be at least 2".to_string(),
            ));
        }
        if let Some(overlap) = self.batch.overlap_size {
            if overlap >= self.batch.max_batch_size {
                return Err(Error::Config(format!(
                    "batch.overlap_size ({}) must be smaller than max_batch_size ({})",
                    overlap, self.batch.max_batch_size
                )));
            }
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::Config(
                "retry.backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if self.breaker.failure_threshold == 0 {
            return Err(Error::Config(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.pipeline.timeout_multiplier <= 0.0 {
            return Err(Error::Config(
                "pipeline.timeout_multiplier must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn override_usize(var: &str, target: &mut usize) {
    if let Ok(value) = std::env::var(var) {
        match value.parse() {
            Ok(parsed) => {
                info!(var, value = %value, "Config override from environment");
                *target = parsed;
            }
            Err(_) => warn!(var, value = %value, "Ignoring unparseable environment override"),
        }
    }
}

fn override_u32(var: &str, target: &mut u32) {
    if let Ok(value) = std::env::var(var) {
        match value.parse() {
            Ok(parsed) => {
                info!(var, value = %value, "Config override from environment");
                *target = parsed;
            }
            Err(_) => warn!(var, value = %value, "Ignoring unparseable environment override"),
        }
    }
}

fn override_u64(var: &str, target: &mut u64) {
    if let Ok(value) = std::env::var(var) {
        match value.parse() {
            Ok(parsed) => {
                info!(var, value = %value, "Config override from environment");
                *target = parsed;
            }
            Err(_) => warn!(var, value = %value, "Ignoring unparseable environment override"),
        }
    }
}
