//! Batch planning
//!
//! Computes how a job's input items divide into provider-sized batches:
//! batch size, overlap width, batch count, and a user-facing wall-clock
//! estimate. Pure arithmetic with no I/O and no failure modes. Callers
//! validate that the job has at least one item before planning.

use pageweave_common::human_time::format_estimate_range;
use serde::{Deserialize, Serialize};

/// Fraction of the batch shared with the adjacent batch
const OVERLAP_FRACTION: f64 = 0.15;
/// Thorough mode shrinks batches for deeper per-item analysis
const THOROUGH_BATCH_FACTOR: f64 = 0.6;
/// Smallest batch thorough mode may produce
const MIN_THOROUGH_BATCH: usize = 2;
/// Fixed per-batch wall-clock assumption for estimates
const SECONDS_PER_BATCH: u64 = 45;

/// What a provider can accept in one call
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ProviderLimits {
    /// Hard cap on items per call
    pub max_items_per_call: usize,
    /// Maximum payload size per call, in bytes
    pub max_payload_bytes: u64,
    /// Batch size the provider performs best at
    pub recommended_batch_size: usize,
}

/// Inputs to batch planning
#[derive(Debug, Clone, Copy)]
pub struct PlanRequest {
    /// Number of input items (pages); must be > 0
    pub total_items: usize,
    /// Capability limits of the provider that will serve the job
    pub limits: ProviderLimits,
    /// Average serialized item size, in bytes
    pub avg_item_bytes: u64,
    /// Shrink batches for deeper per-item analysis
    pub thorough: bool,
}

/// Computed batch plan for one job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPlan {
    /// Items per batch after applying all limits
    pub batch_size: usize,
    /// Items shared between adjacent batches
    pub overlap_size: usize,
    /// Advance per batch (batch_size - overlap_size)
    pub step: usize,
    /// Number of batches needed to cover all items
    pub total_batches: usize,
    /// Wall-clock estimate bounds, seconds (user-facing only)
    pub estimated_secs_low: u64,
    pub estimated_secs_high: u64,
}

impl BatchPlan {
    /// Display form of the estimate, e.g. "6m 00s - 9m 00s"
    pub fn estimate_display(&self) -> String {
        format_estimate_range(self.estimated_secs_low, self.estimated_secs_high)
    }
}

/// Compute the batch plan for a unit of work.
///
/// **Algorithm:**
/// 1. batch = min(recommended, payload-budget count, hard cap)
/// 2. thorough mode: batch = max(floor(batch * 0.6), 2)
/// 3. overlap = max(1, floor(batch * 0.15)), always < batch
/// 4. batches = ceil((total - overlap) / (batch - overlap)), min 1
///
/// The duration estimate assumes a fixed per-batch time; thorough mode
/// widens it to a 2x-3x range since per-item analysis dominates there.
pub fn plan(request: &PlanRequest) -> BatchPlan {
    let payload_budget = if request.avg_item_bytes == 0 {
        usize::MAX
    } else {
        (request.limits.max_payload_bytes / request.avg_item_bytes).max(1) as usize
    };

    let mut batch_size = request
        .limits
        .recommended_batch_size
        .min(payload_budget)
        .min(request.limits.max_items_per_call)
        .max(1);

    if request.thorough {
        batch_size = ((batch_size as f64 * THOROUGH_BATCH_FACTOR).floor() as usize)
            .max(MIN_THOROUGH_BATCH);
    }

    // A batch never exceeds the job itself
    batch_size = batch_size.min(request.total_items).max(1);

    let overlap_size = if batch_size > 1 {
        ((batch_size as f64 * OVERLAP_FRACTION).floor() as usize).max(1)
    } else {
        0
    };
    let step = batch_size - overlap_size;

    let total_batches = if request.total_items <= batch_size {
        1
    } else {
        // ceil((total - overlap) / step), consistent with range generation
        (request.total_items - overlap_size).div_ceil(step)
    };

    let base_secs = total_batches as u64 * SECONDS_PER_BATCH;
    let (low, high) = if request.thorough {
        (base_secs * 2, base_secs * 3)
    } else {
        (base_secs, base_secs)
    };

    BatchPlan {
        batch_size,
        overlap_size,
        step,
        total_batches,
        estimated_secs_low: low,
        estimated_secs_high: high,
    }
}
