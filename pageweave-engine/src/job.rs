//! Job orchestration
//!
//! Runs one analysis job end to end: plan the batches, expand them
//! into overlapping ranges, then process batches strictly in index
//! order. Each batch runs the registered stage pipeline; each stage's
//! provider call goes through failover, retry, and the circuit
//! breaker for its operation class. Continuity hints from recent
//! batches are injected into every provider request, token usage is
//! recorded after every successful call, and progress is emitted as
//! events over an optional channel.
//!
//! Jobs are independent: each owns its ledger and overlap context.
//! Only the breaker registry and the provider priority manager are
//! shared between concurrent jobs.
//!
//! **Per-batch flow:**
//! 1. Check cancellation; emit `BatchStarted`
//! 2. Render continuity hints from the overlap context
//! 3. Run the stage pipeline (raced against the cancellation token)
//! 4. Record entity observations and the batch tail
//! 5. Emit per-stage events; fail the job on a stage failure unless
//!    `continue_on_error` is set
//! 6. Pace with `delay_between_batches` before the next batch
//!
//! After the last batch, per-stage item results from all batches are
//! merged by identity and confidence.

use crate::breaker::{BreakerRegistry, CallFailure};
use crate::fallback::{FallbackCoordinator, FallbackFailure, ProviderAttempt, ProviderPriorityManager};
use crate::overlap::{generate_ranges, merge_results, BatchRange, OverlapContext};
use crate::pipeline::{StageContext, StageDefinition, StagePipeline, StageProcessor, StageResult};
use crate::planner::{plan, BatchPlan, PlanRequest, ProviderLimits};
use crate::retry::RetryExecutor;
use crate::usage::{UsageLedger, UsageRecord};
use chrono::Utc;
use pageweave_common::config::OrchestratorConfig;
use pageweave_common::events::JobEvent;
use pageweave_common::provider::{ItemResult, ModelProvider, PageItem, ProviderRequest, ProviderResponse};
use pageweave_common::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// One stage of a job, without its processing function (the runner
/// supplies the provider-call processor)
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub id: String,
    pub dependencies: Vec<String>,
    pub timeout: Duration,
}

impl StageSpec {
    pub fn new(id: impl Into<String>, dependencies: Vec<String>, timeout: Duration) -> Self {
        Self {
            id: id.into(),
            dependencies,
            timeout,
        }
    }
}

/// Everything needed to run one job
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Input items in analysis order; must be non-empty
    pub items: Vec<PageItem>,
    /// Stages to run per batch; must be non-empty
    pub stages: Vec<StageSpec>,
    /// Capability limits of the providers serving this job
    pub limits: ProviderLimits,
    /// Average serialized item size, for payload budgeting
    pub avg_item_bytes: u64,
    /// Shrink batches for deeper per-item analysis
    pub thorough: bool,
    /// Stage whose item results feed the cross-batch entity state
    /// (item id = entity id, payload = state description)
    pub continuity_stage: Option<String>,
}

/// Successful job outcome
#[derive(Debug, Clone)]
pub struct JobReport {
    pub job_id: Uuid,
    pub plan: BatchPlan,
    pub batches_processed: usize,
    /// Merged per-stage item results, overlap duplicates reconciled
    pub stage_results: HashMap<String, Vec<ItemResult>>,
    pub usage: UsageRecord,
}

/// Terminal job failure with enough context to diagnose it
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub job_id: Uuid,
    pub batch_index: Option<usize>,
    pub stage_id: Option<String>,
    pub message: String,
    /// Every provider turn made before the failure, in order
    pub provider_history: Vec<ProviderAttempt>,
    /// Merged results of stages that completed before the failure,
    /// when any exist
    pub partial_results: Option<HashMap<String, Vec<ItemResult>>>,
    pub usage: UsageRecord,
}

/// How a job ended
#[derive(Debug)]
pub enum JobOutcome {
    Completed(JobReport),
    Failed(JobFailure),
    Cancelled {
        job_id: Uuid,
        batches_completed: usize,
        usage: UsageRecord,
    },
}

/// Best-effort event emission; a missing or closed channel is ignored
#[derive(Clone, Default)]
struct EventSink {
    sender: Option<mpsc::UnboundedSender<JobEvent>>,
}

impl EventSink {
    fn emit(&self, event: JobEvent) {
        if let Some(sender) = &self.sender {
            let _ = sender.send(event);
        }
    }
}

/// Stage processor that serves every stage by calling a model
/// provider through failover, retry, and the circuit breaker.
struct ProviderCall {
    providers: Vec<Arc<dyn ModelProvider>>,
    fallback: FallbackCoordinator,
    breakers: BreakerRegistry,
    priority: Arc<ProviderPriorityManager>,
    /// For reporting nominal backoff delays in retry events
    retry: RetryExecutor,
    ledger: Arc<Mutex<UsageLedger>>,
    history: Arc<Mutex<Vec<ProviderAttempt>>>,
    events: EventSink,
}

impl ProviderCall {
    /// Re-emit retry and switch events from a completed fallback turn
    /// history. Retry delays are reported as the nominal backoff for
    /// the attempt (jitter is not observable after the fact).
    fn emit_history(&self, ctx: &StageContext, history: &[ProviderAttempt]) {
        for (turn_index, turn) in history.iter().enumerate() {
            for attempt in 2..=turn.attempts {
                self.events.emit(JobEvent::RetryScheduled {
                    job_id: ctx.job_id,
                    stage_id: ctx.stage_id.clone(),
                    provider_id: turn.provider_id.clone(),
                    attempt,
                    delay_ms: self.retry.base_delay(attempt - 1).as_millis() as u64,
                    timestamp: Utc::now(),
                });
            }
            if turn_index > 0 {
                self.events.emit(JobEvent::ProviderSwitched {
                    job_id: ctx.job_id,
                    stage_id: ctx.stage_id.clone(),
                    from_provider: history[turn_index - 1].provider_id.clone(),
                    to_provider: turn.provider_id.clone(),
                    switches_used: turn_index as u32,
                    timestamp: Utc::now(),
                });
            }
        }
    }

    fn surface(&self, failure: FallbackFailure) -> Error {
        match (&failure.last_error, failure.history.len()) {
            // A lone provider turn that never switched keeps its
            // classified error intact
            (CallFailure::Provider(e), 1) if failure.switches == 0 => Error::Provider(e.clone()),
            (CallFailure::CircuitOpen { class, remaining }, _) => Error::CircuitOpen {
                class: class.clone(),
                remaining_ms: remaining.as_millis() as u64,
            },
            _ => Error::AllProvidersExhausted {
                attempts: failure.total_attempts,
                switches: failure.switches,
            },
        }
    }
}

#[async_trait::async_trait]
impl StageProcessor for ProviderCall {
    async fn process(&self, ctx: &StageContext) -> Result<ProviderResponse> {
        let ranked = self.priority.rank(&self.providers);
        let request = ProviderRequest {
            job_id: ctx.job_id,
            stage_id: ctx.stage_id.clone(),
            batch_index: ctx.batch_index,
            items: ctx.items.clone(),
            context_hints: ctx.context_hints.clone(),
        };
        let op_name = format!("{}/batch-{}", ctx.stage_id, ctx.batch_index);

        let outcome = self
            .fallback
            .execute(&op_name, &ranked, |provider| {
                let request = request.clone();
                let breaker = self
                    .breakers
                    .for_class(&format!("{}/{}", provider.id(), request.stage_id));
                async move {
                    breaker
                        .call(|| async { provider.invoke(&request).await })
                        .await
                }
            })
            .await;

        match outcome {
            Ok(success) => {
                self.emit_history(ctx, &success.history);
                self.ledger
                    .lock()
                    .map_err(|_| Error::Internal("usage ledger mutex poisoned".into()))?
                    .record(&success.provider_id, success.value.usage);
                self.history
                    .lock()
                    .map_err(|_| Error::Internal("attempt history mutex poisoned".into()))?
                    .extend(success.history);
                Ok(success.value)
            }
            Err(failure) => {
                self.emit_history(ctx, &failure.history);
                self.history
                    .lock()
                    .map_err(|_| Error::Internal("attempt history mutex poisoned".into()))?
                    .extend(failure.history.iter().cloned());
                Err(self.surface(failure))
            }
        }
    }
}

/// Runs jobs against a provider set.
///
/// The runner itself is cheap; per-job state (ledger, overlap
/// context, pipeline) is created inside [`JobRunner::run`]. The
/// breaker registry and priority manager are shared with whatever
/// else the caller runs.
pub struct JobRunner {
    config: OrchestratorConfig,
    providers: Vec<Arc<dyn ModelProvider>>,
    breakers: BreakerRegistry,
    priority: Arc<ProviderPriorityManager>,
    events: EventSink,
}

impl JobRunner {
    pub fn new(
        config: OrchestratorConfig,
        providers: Vec<Arc<dyn ModelProvider>>,
        breakers: BreakerRegistry,
        priority: Arc<ProviderPriorityManager>,
    ) -> Self {
        Self {
            config,
            providers,
            breakers,
            priority,
            events: EventSink::default(),
        }
    }

    /// Attach an event channel; emission is best-effort
    pub fn with_events(mut self, sender: mpsc::UnboundedSender<JobEvent>) -> Self {
        self.events = EventSink {
            sender: Some(sender),
        };
        self
    }

    /// Batch plan with the configured caps and overlap override applied
    fn effective_plan(&self, spec: &JobSpec) -> BatchPlan {
        let mut limits = spec.limits;
        limits.max_items_per_call = limits
            .max_items_per_call
            .min(self.config.batch.max_batch_size);

        let mut plan = plan(&PlanRequest {
            total_items: spec.items.len(),
            limits,
            avg_item_bytes: spec.avg_item_bytes,
            thorough: spec.thorough,
        });

        if let Some(overlap) = self.config.batch.overlap_size {
            let overlap = if plan.batch_size > 1 {
                overlap.min(plan.batch_size - 1)
            } else {
                0
            };
            plan.overlap_size = overlap;
            plan.step = plan.batch_size - overlap;
            plan.total_batches = if spec.items.len() <= plan.batch_size {
                1
            } else {
                (spec.items.len() - overlap).div_ceil(plan.step)
            };
        }
        plan
    }

    /// Render overlap-context state into provider hint strings
    fn render_hints(overlap: &OverlapContext, batch_index: usize) -> Vec<String> {
        let mut hints = Vec::new();
        if !overlap.previous_tail().is_empty() {
            hints.push(format!(
                "items shared with the previous batch: {}",
                overlap.previous_tail().join(", ")
            ));
        }
        for hint in overlap.continuity_hints(batch_index) {
            hints.push(format!(
                "{}: {} (last seen in batch {})",
                hint.entity_id, hint.state, hint.last_seen_batch
            ));
        }
        hints
    }

    fn usage_snapshot(ledger: &Arc<Mutex<UsageLedger>>) -> UsageRecord {
        match ledger.lock() {
            Ok(guard) => guard.snapshot(),
            Err(poisoned) => poisoned.into_inner().snapshot(),
        }
    }

    fn attempt_log(history: &Arc<Mutex<Vec<ProviderAttempt>>>) -> Vec<ProviderAttempt> {
        match history.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Run one job to completion, failure, or cancellation.
    ///
    /// `Err` is reserved for invalid job construction (empty input,
    /// bad stage graph); everything that happens after planning is a
    /// [`JobOutcome`].
    pub async fn run(&self, spec: JobSpec, cancel: CancellationToken) -> Result<JobOutcome> {
        if spec.items.is_empty() {
            return Err(Error::InvalidInput("job has no input items".into()));
        }
        if spec.stages.is_empty() {
            return Err(Error::InvalidInput("job has no stages".into()));
        }
        if let Some(stage) = &spec.continuity_stage {
            if !spec.stages.iter().any(|s| &s.id == stage) {
                return Err(Error::InvalidInput(format!(
                    "continuity stage '{stage}' is not a registered stage"
                )));
            }
        }

        let job_id = Uuid::new_v4();
        let plan = self.effective_plan(&spec);
        let ranges = generate_ranges(spec.items.len(), plan.batch_size, plan.overlap_size);

        let ledger = Arc::new(Mutex::new(UsageLedger::new()));
        let history = Arc::new(Mutex::new(Vec::new()));
        let processor: Arc<dyn StageProcessor> = Arc::new(ProviderCall {
            providers: self.providers.clone(),
            fallback: FallbackCoordinator::new(
                self.config.fallback.clone(),
                RetryExecutor::new(self.config.retry.clone()),
                self.priority.clone(),
            ),
            breakers: self.breakers.clone(),
            priority: self.priority.clone(),
            retry: RetryExecutor::new(self.config.retry.clone()),
            ledger: ledger.clone(),
            history: history.clone(),
            events: self.events.clone(),
        });

        let stages: Vec<StageDefinition> = spec
            .stages
            .iter()
            .map(|s| {
                StageDefinition::new(
                    s.id.clone(),
                    s.dependencies.clone(),
                    s.timeout,
                    processor.clone(),
                )
            })
            .collect();
        let pipeline = StagePipeline::new(self.config.pipeline.clone(), stages)?;

        info!(
            %job_id,
            total_items = spec.items.len(),
            total_batches = ranges.len(),
            batch_size = plan.batch_size,
            overlap = plan.overlap_size,
            estimate = %plan.estimate_display(),
            "Job planned"
        );
        self.events.emit(JobEvent::JobStarted {
            job_id,
            total_items: spec.items.len(),
            total_batches: ranges.len(),
            timestamp: Utc::now(),
        });

        let mut overlap = OverlapContext::new();
        // stage id -> per-batch item results, merged at the end
        let mut collected: HashMap<String, Vec<Vec<ItemResult>>> = HashMap::new();
        let mut any_success = false;
        // batches always run fresh; resumption would thread real prior
        // results here
        let no_prior: HashMap<String, StageResult> = HashMap::new();

        for (batch_index, range) in ranges.iter().enumerate() {
            if cancel.is_cancelled() {
                return Ok(self.cancelled(job_id, batch_index, &ledger));
            }
            self.events.emit(JobEvent::BatchStarted {
                job_id,
                batch_index,
                total_batches: ranges.len(),
                start: range.start,
                end: range.end,
                timestamp: Utc::now(),
            });

            let hints = Self::render_hints(&overlap, batch_index);
            let batch_items: Vec<PageItem> = spec.items[range.start..=range.end].to_vec();
            debug!(
                %job_id,
                batch_index,
                start = range.start,
                end = range.end,
                hints = hints.len(),
                "Batch starting"
            );

            let run =
                pipeline.run_batch(job_id, batch_index, batch_items.clone(), hints, &no_prior);
            let results = tokio::select! {
                _ = cancel.cancelled() => {
                    return Ok(self.cancelled(job_id, batch_index, &ledger));
                }
                result = run => match result {
                    Ok(results) => results,
                    Err(err) => {
                        let (stage_id, message) = match &err {
                            Error::DependencyFailed { stage, .. } => {
                                (Some(stage.clone()), err.to_string())
                            }
                            _ => (None, err.to_string()),
                        };
                        return Ok(self.failed(
                            job_id,
                            Some(batch_index),
                            stage_id,
                            message,
                            &history,
                            &collected,
                            any_success,
                            &ledger,
                        ));
                    }
                },
            };

            // events and collection follow execution order for
            // deterministic output
            let order: Vec<String> = pipeline
                .execution_order()
                .iter()
                .map(|s| s.to_string())
                .collect();
            for (position, stage_id) in order.iter().enumerate() {
                let Some(result) = results.get(stage_id) else {
                    continue;
                };
                self.events.emit(JobEvent::StageCompleted {
                    job_id,
                    batch_index,
                    stage_id: stage_id.clone(),
                    success: result.success,
                    duration_ms: result.duration.as_millis() as u64,
                    progress_percent: (position + 1) as f64 / order.len() as f64 * 100.0,
                    timestamp: Utc::now(),
                });
                if result.success {
                    any_success = true;
                    if let Some(output) = &result.output {
                        collected
                            .entry(stage_id.clone())
                            .or_default()
                            .push(output.items.clone());
                    }
                }
            }

            if !self.config.pipeline.continue_on_error {
                if let Some(failed) = results.values().find(|r| !r.success) {
                    warn!(
                        %job_id,
                        batch_index,
                        stage = %failed.stage_id,
                        "Stage failed, aborting job"
                    );
                    return Ok(self.failed(
                        job_id,
                        Some(batch_index),
                        Some(failed.stage_id.clone()),
                        failed
                            .error
                            .clone()
                            .unwrap_or_else(|| "stage failed".to_string()),
                        &history,
                        &collected,
                        any_success,
                        &ledger,
                    ));
                }
            }

            self.absorb_continuity(&spec, batch_index, range, &batch_items, &results, &mut overlap);

            self.events.emit(JobEvent::BatchCompleted {
                job_id,
                batch_index,
                total_batches: ranges.len(),
                timestamp: Utc::now(),
            });

            if batch_index + 1 < ranges.len() && self.config.batch.delay_between_batches_ms > 0 {
                let pause =
                    Duration::from_millis(self.config.batch.delay_between_batches_ms);
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Ok(self.cancelled(job_id, batch_index + 1, &ledger));
                    }
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }

        let stage_results: HashMap<String, Vec<ItemResult>> = collected
            .into_iter()
            .map(|(stage_id, batches)| (stage_id, merge_results(&batches)))
            .collect();

        info!(
            %job_id,
            batches = ranges.len(),
            stages = stage_results.len(),
            "Job completed"
        );
        self.events.emit(JobEvent::JobCompleted {
            job_id,
            batches_processed: ranges.len(),
            timestamp: Utc::now(),
        });

        Ok(JobOutcome::Completed(JobReport {
            job_id,
            plan,
            batches_processed: ranges.len(),
            stage_results,
            usage: Self::usage_snapshot(&ledger),
        }))
    }

    /// Feed a completed batch back into the overlap context: tail item
    /// identities plus entity observations from the continuity stage.
    fn absorb_continuity(
        &self,
        spec: &JobSpec,
        batch_index: usize,
        range: &BatchRange,
        batch_items: &[PageItem],
        results: &HashMap<String, StageResult>,
        overlap: &mut OverlapContext,
    ) {
        if range.tail_overlap > 0 {
            let tail: Vec<String> = batch_items
                [batch_items.len() - range.tail_overlap..]
                .iter()
                .map(|item| item.id.clone())
                .collect();
            overlap.set_previous_tail(tail);
        } else {
            overlap.set_previous_tail(Vec::new());
        }

        if let Some(stage_id) = &spec.continuity_stage {
            if let Some(result) = results.get(stage_id).filter(|r| r.success) {
                if let Some(output) = &result.output {
                    for item in &output.items {
                        overlap.record_entity(
                            batch_index,
                            &item.item_id,
                            &item.payload,
                            item.confidence,
                        );
                    }
                }
            }
        }
    }

    fn cancelled(
        &self,
        job_id: Uuid,
        batches_completed: usize,
        ledger: &Arc<Mutex<UsageLedger>>,
    ) -> JobOutcome {
        info!(%job_id, batches_completed, "Job cancelled");
        self.events.emit(JobEvent::JobCancelled {
            job_id,
            batches_completed,
            timestamp: Utc::now(),
        });
        JobOutcome::Cancelled {
            job_id,
            batches_completed,
            usage: Self::usage_snapshot(ledger),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn failed(
        &self,
        job_id: Uuid,
        batch_index: Option<usize>,
        stage_id: Option<String>,
        message: String,
        history: &Arc<Mutex<Vec<ProviderAttempt>>>,
        collected: &HashMap<String, Vec<Vec<ItemResult>>>,
        any_success: bool,
        ledger: &Arc<Mutex<UsageLedger>>,
    ) -> JobOutcome {
        warn!(%job_id, ?batch_index, ?stage_id, %message, "Job failed");
        self.events.emit(JobEvent::JobFailed {
            job_id,
            batch_index,
            stage_id: stage_id.clone(),
            message: message.clone(),
            partial_results: any_success,
            timestamp: Utc::now(),
        });

        let partial_results = if any_success {
            Some(
                collected
                    .iter()
                    .map(|(stage, batches)| (stage.clone(), merge_results(batches)))
                    .collect(),
            )
        } else {
            None
        };

        JobOutcome::Failed(JobFailure {
            job_id,
            batch_index,
            stage_id,
            message,
            provider_history: Self::attempt_log(history),
            partial_results,
            usage: Self::usage_snapshot(ledger),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pageweave_common::config::BatchConfig;

    fn runner_with_batch(batch: BatchConfig) -> JobRunner {
        let config = OrchestratorConfig {
            batch,
            ..OrchestratorConfig::default()
        };
        JobRunner::new(
            config,
            Vec::new(),
            BreakerRegistry::default(),
            Arc::new(ProviderPriorityManager::new()),
        )
    }

    fn spec(total_items: usize) -> JobSpec {
        JobSpec {
            items: (0..total_items)
                .map(|i| PageItem {
                    id: format!("p{i}"),
                    index: i,
                    payload: String::new(),
                })
                .collect(),
            stages: vec![StageSpec::new("layout", Vec::new(), Duration::from_secs(5))],
            limits: ProviderLimits {
                max_items_per_call: 50,
                max_payload_bytes: 10_000_000,
                recommended_batch_size: 12,
            },
            avg_item_bytes: 1_000,
            thorough: false,
            continuity_stage: None,
        }
    }

    #[test]
    fn test_config_overlap_override() {
        let runner = runner_with_batch(BatchConfig {
            max_batch_size: 20,
            overlap_size: Some(2),
            delay_between_batches_ms: 0,
        });
        let plan = runner.effective_plan(&spec(100));
        assert_eq!(plan.batch_size, 12);
        assert_eq!(plan.overlap_size, 2);
        assert_eq!(plan.step, 10);
        assert_eq!(plan.total_batches, 10);
    }

    #[test]
    fn test_config_batch_cap_applies() {
        let runner = runner_with_batch(BatchConfig {
            max_batch_size: 5,
            overlap_size: None,
            delay_between_batches_ms: 0,
        });
        let plan = runner.effective_plan(&spec(100));
        assert_eq!(plan.batch_size, 5);
    }

    #[test]
    fn test_overlap_override_clamped_below_batch() {
        let runner = runner_with_batch(BatchConfig {
            max_batch_size: 20,
            overlap_size: Some(99),
            delay_between_batches_ms: 0,
        });
        let plan = runner.effective_plan(&spec(100));
        assert!(plan.overlap_size < plan.batch_size);
        assert!(plan.step >= 1);
    }

    #[tokio::test]
    async fn test_empty_job_rejected() {
        let runner = runner_with_batch(BatchConfig::default());
        let mut empty = spec(0);
        empty.items.clear();
        let err = runner
            .run(empty, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_unknown_continuity_stage_rejected() {
        let runner = runner_with_batch(BatchConfig::default());
        let mut bad = spec(10);
        bad.continuity_stage = Some("ghost".to_string());
        let err = runner.run(bad, CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[test]
    fn test_hint_rendering() {
        let mut overlap = OverlapContext::new();
        overlap.set_previous_tail(vec!["p10".to_string(), "p11".to_string()]);
        overlap.record_entity(1, "elena", "wounded", 0.8);

        let hints = JobRunner::render_hints(&overlap, 2);
        assert_eq!(hints.len(), 2);
        assert!(hints[0].contains("p10, p11"));
        assert!(hints[1].contains("elena"));
        assert!(hints[1].contains("wounded"));
    }
}
