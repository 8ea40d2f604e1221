//! Pageweave orchestration engine
//!
//! Turns a set of input items plus a stage graph into provider calls:
//! batch planning with overlap, dependency-ordered stage execution,
//! retry with backoff, per-class circuit breaking, provider failover,
//! and token/cost accounting. [`job::JobRunner`] wires the pieces
//! together; each piece is also usable on its own.

pub mod breaker;
pub mod fallback;
pub mod job;
pub mod overlap;
pub mod pipeline;
pub mod planner;
pub mod retry;
pub mod usage;

pub use crate::breaker::{BreakerRegistry, CallFailure, CircuitBreaker, CircuitState};
pub use crate::fallback::{
    FallbackCoordinator, FallbackFailure, FallbackOutcome, ProviderAttempt,
    ProviderPriorityManager,
};
pub use crate::job::{JobFailure, JobOutcome, JobReport, JobRunner, JobSpec, StageSpec};
pub use crate::overlap::{generate_ranges, merge_results, BatchRange, ContinuityHint, OverlapContext};
pub use crate::pipeline::{
    StageContext, StageDefinition, StagePipeline, StageProcessor, StageResult,
};
pub use crate::planner::{plan, BatchPlan, PlanRequest, ProviderLimits};
pub use crate::retry::{RetryClass, RetryExecutor, RetryOutcome};
pub use crate::usage::{CostRates, UsageLedger, UsageRecord};
