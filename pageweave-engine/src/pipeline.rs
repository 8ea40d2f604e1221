//! Dependency-ordered stage execution for one batch
//!
//! A pipeline is registered once from a set of stage definitions and
//! then run once per batch. Registration validates the dependency
//! graph: unknown dependencies and cycles are construction-time
//! errors, detected by depth-first traversal with an explicit
//! visiting set rather than by letting recursion run away.
//!
//! At run time stages execute in topological order. A stage whose
//! dependency did not succeed is either a synthetic failed result
//! (`continue_on_error`) or an abort. Each processor races a scaled
//! per-stage timeout; elapsing the timer is an ordinary stage
//! failure, never a panic or a pipeline-level error.

use pageweave_common::config::PipelineConfig;
use pageweave_common::provider::{PageItem, ProviderResponse};
use pageweave_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What a stage processor sees for one batch
#[derive(Debug, Clone)]
pub struct StageContext {
    pub job_id: Uuid,
    pub stage_id: String,
    /// Zero-based batch index within the job
    pub batch_index: usize,
    /// Items of this batch, in input order
    pub items: Vec<PageItem>,
    /// Continuity hints rendered for the provider
    pub context_hints: Vec<String>,
    /// Results of stages already executed for this batch, by stage id
    pub previous_results: HashMap<String, StageResult>,
}

/// Outcome of one stage execution for one batch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    pub stage_id: String,
    pub success: bool,
    /// Provider output on success
    pub output: Option<ProviderResponse>,
    /// Failure description on failure
    pub error: Option<String>,
    /// Wall time spent executing (zero for skipped/synthetic results)
    pub duration: Duration,
}

impl StageResult {
    fn failed(stage_id: &str, error: impl Into<String>, duration: Duration) -> Self {
        Self {
            stage_id: stage_id.to_string(),
            success: false,
            output: None,
            error: Some(error.into()),
            duration,
        }
    }
}

/// The work a stage performs for one batch
#[async_trait::async_trait]
pub trait StageProcessor: Send + Sync {
    async fn process(&self, ctx: &StageContext) -> Result<ProviderResponse>;
}

/// A named unit of work with declared dependencies. Immutable once the
/// pipeline is built.
#[derive(Clone)]
pub struct StageDefinition {
    pub id: String,
    /// Stage ids that must succeed before this stage runs
    pub dependencies: Vec<String>,
    pub timeout: Duration,
    pub processor: Arc<dyn StageProcessor>,
}

impl StageDefinition {
    pub fn new(
        id: impl Into<String>,
        dependencies: Vec<String>,
        timeout: Duration,
        processor: Arc<dyn StageProcessor>,
    ) -> Self {
        Self {
            id: id.into(),
            dependencies,
            timeout,
            processor,
        }
    }
}

impl std::fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageDefinition")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// DFS visit state for cycle detection
#[derive(Clone, Copy, PartialEq)]
enum Visit {
    Unvisited,
    Visiting,
    Done,
}

/// Executes registered stages in dependency order, once per batch
#[derive(Debug)]
pub struct StagePipeline {
    config: PipelineConfig,
    stages: Vec<StageDefinition>,
    /// Indices into `stages`, dependencies-first
    topo_order: Vec<usize>,
}

impl StagePipeline {
    /// Build a pipeline, validating the dependency graph.
    ///
    /// Fails on duplicate stage ids, dependencies on unregistered
    /// stages, and cycles.
    pub fn new(config: PipelineConfig, stages: Vec<StageDefinition>) -> Result<Self> {
        let mut index_of: HashMap<&str, usize> = HashMap::new();
        for (i, stage) in stages.iter().enumerate() {
            if index_of.insert(stage.id.as_str(), i).is_some() {
                return Err(Error::InvalidInput(format!(
                    "duplicate stage id '{}'",
                    stage.id
                )));
            }
        }
        for stage in &stages {
            for dep in &stage.dependencies {
                if !index_of.contains_key(dep.as_str()) {
                    return Err(Error::InvalidInput(format!(
                        "stage '{}' depends on unregistered stage '{}'",
                        stage.id, dep
                    )));
                }
            }
        }

        let mut visit = vec![Visit::Unvisited; stages.len()];
        let mut topo_order = Vec::with_capacity(stages.len());
        for i in 0..stages.len() {
            Self::visit(i, &stages, &index_of, &mut visit, &mut topo_order)?;
        }

        debug!(
            stages = stages.len(),
            order = ?topo_order.iter().map(|&i| stages[i].id.as_str()).collect::<Vec<_>>(),
            "Pipeline registered"
        );
        Ok(Self {
            config,
            stages,
            topo_order,
        })
    }

    /// Post-order DFS; a back edge to a stage in the visiting set is a
    /// cycle.
    fn visit(
        index: usize,
        stages: &[StageDefinition],
        index_of: &HashMap<&str, usize>,
        visit: &mut [Visit],
        order: &mut Vec<usize>,
    ) -> Result<()> {
        match visit[index] {
            Visit::Done => return Ok(()),
            Visit::Visiting => {
                return Err(Error::InvalidInput(format!(
                    "dependency cycle through stage '{}'",
                    stages[index].id
                )));
            }
            Visit::Unvisited => {}
        }
        visit[index] = Visit::Visiting;
        for dep in &stages[index].dependencies {
            let dep_index = index_of[dep.as_str()];
            Self::visit(dep_index, stages, index_of, visit, order)?;
        }
        visit[index] = Visit::Done;
        order.push(index);
        Ok(())
    }

    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }

    /// Stage ids in execution order
    pub fn execution_order(&self) -> Vec<&str> {
        self.topo_order
            .iter()
            .map(|&i| self.stages[i].id.as_str())
            .collect()
    }

    /// Completed-stage count over registered stages, as a percentage
    pub fn progress_percent(&self, results: &HashMap<String, StageResult>) -> f64 {
        if self.stages.is_empty() {
            return 100.0;
        }
        results.len() as f64 / self.stages.len() as f64 * 100.0
    }

    /// Run every stage for one batch.
    ///
    /// `prior_results` holds results from an earlier run of the same
    /// batch (a resume); successful entries are carried over unchanged
    /// when `skip_completed` is set. Returns results keyed by stage id,
    /// or aborts with `DependencyFailed` when a dependency is
    /// unsatisfied and `continue_on_error` is off.
    pub async fn run_batch(
        &self,
        job_id: Uuid,
        batch_index: usize,
        items: Vec<PageItem>,
        context_hints: Vec<String>,
        prior_results: &HashMap<String, StageResult>,
    ) -> Result<HashMap<String, StageResult>> {
        let mut results: HashMap<String, StageResult> = HashMap::new();

        for &index in &self.topo_order {
            let stage = &self.stages[index];

            if self.config.skip_completed {
                if let Some(prior) = prior_results.get(&stage.id).filter(|r| r.success) {
                    debug!(stage = %stage.id, batch_index, "Skipping already-completed stage");
                    results.insert(stage.id.clone(), prior.clone());
                    continue;
                }
            }

            if let Some(unsatisfied) = stage
                .dependencies
                .iter()
                .find(|dep| !results.get(*dep).map(|r| r.success).unwrap_or(false))
            {
                if self.config.continue_on_error {
                    warn!(
                        stage = %stage.id,
                        dependency = %unsatisfied,
                        batch_index,
                        "Dependency unsatisfied, recording synthetic failure"
                    );
                    results.insert(
                        stage.id.clone(),
                        StageResult::failed(
                            &stage.id,
                            format!("dependency '{unsatisfied}' did not complete"),
                            Duration::ZERO,
                        ),
                    );
                    continue;
                }
                return Err(Error::DependencyFailed {
                    stage: stage.id.clone(),
                    dependency: unsatisfied.clone(),
                });
            }

            let ctx = StageContext {
                job_id,
                stage_id: stage.id.clone(),
                batch_index,
                items: items.clone(),
                context_hints: context_hints.clone(),
                previous_results: results.clone(),
            };
            let budget = stage.timeout.mul_f64(self.config.timeout_multiplier);
            let started = tokio::time::Instant::now();

            let result = match tokio::time::timeout(budget, stage.processor.process(&ctx)).await {
                Ok(Ok(output)) => {
                    let duration = started.elapsed();
                    info!(
                        stage = %stage.id,
                        batch_index,
                        duration_ms = duration.as_millis() as u64,
                        "Stage completed"
                    );
                    StageResult {
                        stage_id: stage.id.clone(),
                        success: true,
                        output: Some(output),
                        error: None,
                        duration,
                    }
                }
                Ok(Err(err)) => {
                    let duration = started.elapsed();
                    warn!(
                        stage = %stage.id,
                        batch_index,
                        error = %err,
                        "Stage failed"
                    );
                    StageResult::failed(&stage.id, err.to_string(), duration)
                }
                Err(_elapsed) => {
                    warn!(
                        stage = %stage.id,
                        batch_index,
                        timeout_ms = budget.as_millis() as u64,
                        "Stage timed out"
                    );
                    StageResult::failed(
                        &stage.id,
                        format!("timed out after {} ms", budget.as_millis()),
                        budget,
                    )
                }
            };
            results.insert(stage.id.clone(), result);
        }

        Ok(results)
    }
}
