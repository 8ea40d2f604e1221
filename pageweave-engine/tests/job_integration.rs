//! End-to-end job runner tests with scripted providers

use pageweave_common::config::{
    BatchConfig, BreakerConfig, FallbackConfig, OrchestratorConfig, PipelineConfig, RetryConfig,
};
use pageweave_common::error::{ErrorKind, ProviderError};
use pageweave_common::events::JobEvent;
use pageweave_common::provider::{
    ItemResult, ModelProvider, PageItem, ProviderRequest, ProviderResponse, TokenUsage,
};
use pageweave_engine::breaker::BreakerRegistry;
use pageweave_engine::fallback::ProviderPriorityManager;
use pageweave_engine::job::{JobOutcome, JobRunner, JobSpec, StageSpec};
use pageweave_engine::planner::ProviderLimits;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pageweave_engine=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

type Behavior =
    Box<dyn Fn(&ProviderRequest, u32) -> Result<ProviderResponse, ProviderError> + Send + Sync>;

/// Provider whose behavior is scripted per call; records every request
struct TestProvider {
    id: String,
    usable: bool,
    calls: AtomicU32,
    requests: Mutex<Vec<ProviderRequest>>,
    behavior: Behavior,
}

impl TestProvider {
    fn ok(id: &str) -> Arc<Self> {
        Self::scripted(id, Box::new(|req, _| Ok(respond(req))))
    }

    fn failing(id: &str, kind: ErrorKind) -> Arc<Self> {
        Self::scripted(
            id,
            Box::new(move |_, _| Err(ProviderError::new(kind, "scripted failure"))),
        )
    }

    fn scripted(id: &str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            usable: true,
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
            behavior,
        })
    }

    fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn recorded_requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl ModelProvider for TestProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_usable(&self) -> bool {
        self.usable
    }

    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        (self.behavior)(request, call)
    }
}

/// Standard successful response: one result per item, confidence
/// rising with batch index so later batches win overlap merges
fn respond(request: &ProviderRequest) -> ProviderResponse {
    let confidence = (0.5 + request.batch_index as f64 * 0.01).min(1.0);
    ProviderResponse {
        payload: format!("{} batch {}", request.stage_id, request.batch_index),
        items: request
            .items
            .iter()
            .map(|item| {
                ItemResult::new(
                    &item.id,
                    format!("{}:{}", request.stage_id, item.id),
                    confidence,
                )
            })
            .collect(),
        usage: TokenUsage::new(100, 50),
    }
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        batch: BatchConfig {
            max_batch_size: 20,
            overlap_size: Some(2),
            delay_between_batches_ms: 0,
        },
        retry: RetryConfig {
            max_retries: 0,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            backoff_multiplier: 2.0,
        },
        breaker: BreakerConfig {
            failure_threshold: 100,
            reset_timeout_ms: 60_000,
        },
        fallback: FallbackConfig {
            max_switches: 2,
            switch_on_error: false,
            switch_on_rate_limit: true,
        },
        pipeline: PipelineConfig {
            continue_on_error: false,
            skip_completed: true,
            timeout_multiplier: 1.0,
        },
    }
}

fn items(total: usize) -> Vec<PageItem> {
    (0..total)
        .map(|i| PageItem {
            id: format!("p{i}"),
            index: i,
            payload: format!("payload-{i}"),
        })
        .collect()
}

fn spec(total: usize, stages: Vec<StageSpec>) -> JobSpec {
    JobSpec {
        items: items(total),
        stages,
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

fn two_stage_spec(total: usize) -> JobSpec {
    spec(
        total,
        vec![
            StageSpec::new("layout", Vec::new(), Duration::from_secs(5)),
            StageSpec::new(
                "summary",
                vec!["layout".to_string()],
                Duration::from_secs(5),
            ),
        ],
    )
}

fn runner(
    config: OrchestratorConfig,
    providers: Vec<Arc<dyn ModelProvider>>,
) -> (JobRunner, mpsc::UnboundedReceiver<JobEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let runner = JobRunner::new(
        config,
        providers,
        BreakerRegistry::default(),
        Arc::new(ProviderPriorityManager::new()),
    )
    .with_events(tx);
    (runner, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<JobEvent>) -> Vec<JobEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_job_completes_and_merges_overlap() {
    init_tracing();
    let provider = TestProvider::ok("gemini");
    let (runner, mut rx) = runner(fast_config(), vec![provider.clone()]);

    // batch 12, overlap 2, step 10: 100 items -> 10 batches
    let outcome = runner
        .run(two_stage_spec(100), CancellationToken::new())
        .await
        .unwrap();

    let report = match outcome {
        JobOutcome::Completed(report) => report,
        other => panic!("expected completion, got {other:?}"),
    };
    assert_eq!(report.batches_processed, 10);
    assert_eq!(report.plan.total_batches, 10);

    // every item appears exactly once per stage despite overlap
    for stage in ["layout", "summary"] {
        let results = &report.stage_results[stage];
        assert_eq!(results.len(), 100, "stage {stage}");
        let ids: HashSet<&str> = results.iter().map(|r| r.item_id.as_str()).collect();
        assert_eq!(ids.len(), 100);
    }

    // overlap items carry the later batch's payload (ties broken by
    // confidence, which rises with batch index)
    let p10 = report.stage_results["layout"]
        .iter()
        .find(|r| r.item_id == "p10")
        .unwrap();
    assert!((p10.confidence - 0.51).abs() < 1e-9);

    // 10 batches x 2 stages, one call each
    assert_eq!(provider.call_count(), 20);
    assert_eq!(report.usage.prompt_tokens, 20 * 100);
    assert_eq!(report.usage.by_provider["gemini"].calls, 20);

    let events = drain(&mut rx);
    assert!(matches!(events.first(), Some(JobEvent::JobStarted { total_batches: 10, .. })));
    assert!(matches!(events.last(), Some(JobEvent::JobCompleted { .. })));
    let batch_starts = events
        .iter()
        .filter(|e| matches!(e, JobEvent::BatchStarted { .. }))
        .count();
    assert_eq!(batch_starts, 10);
}

#[tokio::test]
async fn test_rate_limited_provider_fails_over() {
    let limited = TestProvider::failing("primary", ErrorKind::RateLimit);
    let healthy = TestProvider::ok("secondary");
    let (runner, mut rx) = runner(fast_config(), vec![limited.clone(), healthy.clone()]);

    let outcome = runner
        .run(two_stage_spec(15), CancellationToken::new())
        .await
        .unwrap();

    let report = match outcome {
        JobOutcome::Completed(report) => report,
        other => panic!("expected completion via failover, got {other:?}"),
    };
    // all billing went to the provider that served the calls
    assert!(report.usage.by_provider.contains_key("secondary"));
    assert!(!report.usage.by_provider.contains_key("primary"));
    assert!(healthy.call_count() > 0);

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        JobEvent::ProviderSwitched { from_provider, to_provider, .. }
            if from_provider == "primary" && to_provider == "secondary"
    )));
}

#[tokio::test]
async fn test_auth_failure_switches_without_retrying() {
    let locked_out = TestProvider::failing("primary", ErrorKind::Authentication);
    let healthy = TestProvider::ok("secondary");
    let mut config = fast_config();
    config.retry.max_retries = 3;
    let (runner, _rx) = runner(config, vec![locked_out.clone(), healthy]);

    let spec = spec(
        5,
        vec![StageSpec::new("layout", Vec::new(), Duration::from_secs(5))],
    );
    let outcome = runner.run(spec, CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Completed(_)));
    // terminal error: one call, no retries against the bad credentials
    assert_eq!(locked_out.call_count(), 1);
}

#[tokio::test]
async fn test_all_providers_exhausted_fails_job() {
    let a = TestProvider::failing("a", ErrorKind::RateLimit);
    let b = TestProvider::failing("b", ErrorKind::RateLimit);
    let c = TestProvider::failing("c", ErrorKind::RateLimit);
    let (runner, mut rx) = runner(fast_config(), vec![a, b, c]);

    let spec = spec(
        5,
        vec![StageSpec::new("layout", Vec::new(), Duration::from_secs(5))],
    );
    let outcome = runner.run(spec, CancellationToken::new()).await.unwrap();

    let failure = match outcome {
        JobOutcome::Failed(failure) => failure,
        other => panic!("expected failure, got {other:?}"),
    };
    assert_eq!(failure.batch_index, Some(0));
    assert_eq!(failure.stage_id.as_deref(), Some("layout"));
    assert!(failure.partial_results.is_none());
    let order: Vec<&str> = failure
        .provider_history
        .iter()
        .map(|a| a.provider_id.as_str())
        .collect();
    assert_eq!(order, ["a", "b", "c"]);

    // attempt history is serializable for diagnostics surfaces
    let json = serde_json::to_value(&failure.provider_history).unwrap();
    assert_eq!(json[0]["error_kind"], "RateLimit");

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        JobEvent::JobFailed { partial_results: false, .. }
    )));
}

#[tokio::test]
async fn test_terminal_error_does_not_switch_and_fails_job() {
    let broken = TestProvider::failing("primary", ErrorKind::InvalidRequest);
    let healthy = TestProvider::ok("secondary");
    let (runner, _rx) = runner(fast_config(), vec![broken, healthy.clone()]);

    let spec = spec(
        5,
        vec![StageSpec::new("layout", Vec::new(), Duration::from_secs(5))],
    );
    let outcome = runner.run(spec, CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Failed(_)));
    assert_eq!(healthy.call_count(), 0);
}

#[tokio::test]
async fn test_partial_results_survive_mid_job_failure() {
    // succeeds for batch 0, then fails terminally
    let provider = TestProvider::scripted(
        "flaky",
        Box::new(|req, _| {
            if req.batch_index == 0 {
                Ok(respond(req))
            } else {
                Err(ProviderError::new(ErrorKind::InvalidRequest, "bad batch"))
            }
        }),
    );
    let (runner, _rx) = runner(fast_config(), vec![provider]);

    let spec = spec(
        30,
        vec![StageSpec::new("layout", Vec::new(), Duration::from_secs(5))],
    );
    let outcome = runner.run(spec, CancellationToken::new()).await.unwrap();

    let failure = match outcome {
        JobOutcome::Failed(failure) => failure,
        other => panic!("expected failure, got {other:?}"),
    };
    assert_eq!(failure.batch_index, Some(1));
    let partial = failure.partial_results.expect("batch 0 results kept");
    assert_eq!(partial["layout"].len(), 12); // one full batch
    // usage from the successful batch is preserved
    assert_eq!(failure.usage.by_provider["flaky"].calls, 1);
}

#[tokio::test]
async fn test_cancellation_preserves_usage() {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    // cancels the job while serving batch 1
    let provider = TestProvider::scripted(
        "gemini",
        Box::new(move |req, _| {
            if req.batch_index == 1 {
                trigger.cancel();
            }
            Ok(respond(req))
        }),
    );
    let (runner, mut rx) = runner(fast_config(), vec![provider]);

    let spec = spec(
        50,
        vec![StageSpec::new("layout", Vec::new(), Duration::from_secs(5))],
    );
    let outcome = runner.run(spec, cancel).await.unwrap();

    let (batches_completed, usage) = match outcome {
        JobOutcome::Cancelled {
            batches_completed,
            usage,
            ..
        } => (batches_completed, usage),
        other => panic!("expected cancellation, got {other:?}"),
    };
    assert!(batches_completed >= 1);
    assert!(batches_completed < 5); // 50 items, step 10
    assert!(usage.prompt_tokens >= 100); // batch 0 was billed

    let events = drain(&mut rx);
    assert!(events
        .iter()
        .any(|e| matches!(e, JobEvent::JobCancelled { .. })));
}

#[tokio::test]
async fn test_pre_cancelled_job_does_no_work() {
    let provider = TestProvider::ok("gemini");
    let (runner, _rx) = runner(fast_config(), vec![provider.clone()]);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let spec = spec(
        20,
        vec![StageSpec::new("layout", Vec::new(), Duration::from_secs(5))],
    );
    let outcome = runner.run(spec, cancel).await.unwrap();
    assert!(matches!(
        outcome,
        JobOutcome::Cancelled {
            batches_completed: 0,
            ..
        }
    ));
    assert_eq!(provider.call_count(), 0);
}

#[tokio::test]
async fn test_continuity_hints_reach_later_batches() {
    let provider = TestProvider::scripted(
        "gemini",
        Box::new(|req, _| {
            let confidence = 0.9;
            Ok(ProviderResponse {
                payload: String::new(),
                items: req
                    .items
                    .iter()
                    .map(|item| ItemResult::new(&item.id, format!("state of {}", item.id), confidence))
                    .collect(),
                usage: TokenUsage::new(10, 5),
            })
        }),
    );
    let (runner, _rx) = runner(fast_config(), vec![provider.clone()]);

    let mut spec = spec(
        30,
        vec![StageSpec::new("entities", Vec::new(), Duration::from_secs(5))],
    );
    spec.continuity_stage = Some("entities".to_string());

    let outcome = runner.run(spec, CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Completed(_)));

    let requests = provider.recorded_requests();
    let first = requests.iter().find(|r| r.batch_index == 0).unwrap();
    assert!(first.context_hints.is_empty());

    let second = requests.iter().find(|r| r.batch_index == 1).unwrap();
    // tail of batch 0 plus entity observations from batch 0
    assert!(second
        .context_hints
        .iter()
        .any(|h| h.contains("shared with the previous batch")));
    assert!(second
        .context_hints
        .iter()
        .any(|h| h.contains("state of p0")));
}

#[tokio::test]
async fn test_priority_ordering_selects_best_provider() {
    let low = TestProvider::ok("low");
    let high = TestProvider::ok("high");
    let priority = Arc::new(ProviderPriorityManager::new());
    priority.register("low", 1.0);
    priority.register("high", 5.0);

    let runner = JobRunner::new(
        fast_config(),
        vec![low.clone(), high.clone()],
        BreakerRegistry::default(),
        priority,
    );
    let spec = spec(
        5,
        vec![StageSpec::new("layout", Vec::new(), Duration::from_secs(5))],
    );
    let outcome = runner.run(spec, CancellationToken::new()).await.unwrap();
    assert!(matches!(outcome, JobOutcome::Completed(_)));
    assert_eq!(low.call_count(), 0);
    assert!(high.call_count() > 0);
}

#[tokio::test]
async fn test_dependent_stage_sees_failure_with_continue_on_error() {
    // layout fails terminally; summary depends on it
    let provider = TestProvider::scripted(
        "gemini",
        Box::new(|req, _| {
            if req.stage_id == "layout" {
                Err(ProviderError::new(ErrorKind::ContentFilter, "refused"))
            } else {
                Ok(respond(req))
            }
        }),
    );
    let mut config = fast_config();
    config.pipeline.continue_on_error = true;
    let (runner, _rx) = runner(config, vec![provider.clone()]);

    let outcome = runner
        .run(two_stage_spec(5), CancellationToken::new())
        .await
        .unwrap();
    let report = match outcome {
        JobOutcome::Completed(report) => report,
        other => panic!("expected completion, got {other:?}"),
    };
    // neither stage produced results: layout failed, summary synthetic
    assert!(report.stage_results.is_empty());
    // summary was never sent to the provider
    assert!(provider
        .recorded_requests()
        .iter()
        .all(|r| r.stage_id == "layout"));
}
