//! Overlapping batch ranges and result reconciliation
//!
//! Adjacent batches intentionally share a few items so the model keeps
//! cross-batch continuity (recurring names, running scene state). That
//! means the same item can be analyzed twice; reconciliation is
//! identity-based: for each item identity the highest-confidence result
//! wins, and ties favor the later batch, which saw more context.
//!
//! Deduplication is always by item identity, never by arithmetic on
//! batch indices: index arithmetic both over- and under-skips near
//! batch boundaries.

use pageweave_common::provider::ItemResult;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

/// Entities older than this many batches drop out of the hint set
const HINT_WINDOW_BATCHES: usize = 2;

/// A contiguous slice of input items assigned to one provider call.
///
/// `start..=end` are input-order indices. `head_overlap` items at the
/// front are shared with the previous range, `tail_overlap` at the back
/// with the next; both are zero at the job edges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRange {
    pub start: usize,
    /// Inclusive
    pub end: usize,
    pub head_overlap: usize,
    pub tail_overlap: usize,
    pub is_first: bool,
    pub is_last: bool,
}

impl BatchRange {
    /// Number of items covered, inclusive of both ends
    pub fn len(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        false // a range always covers at least its start index
    }
}

/// Generate overlapping ranges covering `[0, total - 1]`.
///
/// Step is `batch_size - overlap_size`; range *i* covers
/// `[i*step, min(i*step + batch_size - 1, total - 1)]`. Generation
/// stops once the input is covered, so the ranges always cover the
/// index space with no gaps and only adjacent ranges overlap.
///
/// Returns an empty vec for `total == 0`; callers validate non-empty
/// jobs before planning.
pub fn generate_ranges(total: usize, batch_size: usize, overlap_size: usize) -> Vec<BatchRange> {
    if total == 0 || batch_size == 0 {
        return Vec::new();
    }
    // A degenerate overlap would stall the loop
    let overlap = overlap_size.min(batch_size - 1);
    let step = batch_size - overlap;

    let mut ranges = Vec::new();
    let mut index = 0;
    loop {
        let start = index * step;
        let end = (start + batch_size - 1).min(total - 1);
        ranges.push(BatchRange {
            start,
            end,
            head_overlap: 0,
            tail_overlap: 0,
            is_first: index == 0,
            is_last: false,
        });
        if end == total - 1 {
            break;
        }
        index += 1;
    }

    let last = ranges.len() - 1;
    ranges[last].is_last = true;
    for i in 0..ranges.len() {
        if i > 0 {
            ranges[i].head_overlap = ranges[i - 1].end.saturating_sub(ranges[i].start) + 1;
        }
        if i < last {
            ranges[i].tail_overlap = ranges[i].end.saturating_sub(ranges[i + 1].start) + 1;
        }
    }
    ranges
}

/// Merge per-batch item results into one set keyed by item identity.
///
/// **Merge strategy:**
/// - Highest confidence wins across all batches that produced the item
/// - Equal confidence favors the later batch (more context available)
/// - Output preserves first-seen identity order, so the merge is
///   deterministic and idempotent for identical inputs
pub fn merge_results(batches: &[Vec<ItemResult>]) -> Vec<ItemResult> {
    let mut order: Vec<String> = Vec::new();
    let mut best: HashMap<String, ItemResult> = HashMap::new();

    for (batch_index, batch) in batches.iter().enumerate() {
        for result in batch {
            match best.get(&result.item_id) {
                Some(existing) if result.confidence < existing.confidence => {
                    debug!(
                        item_id = %result.item_id,
                        batch_index,
                        kept = existing.confidence,
                        dropped = result.confidence,
                        "Keeping higher-confidence duplicate"
                    );
                }
                Some(_) => {
                    // >= replaces: later batch wins ties
                    best.insert(result.item_id.clone(), result.clone());
                }
                None => {
                    order.push(result.item_id.clone());
                    best.insert(result.item_id.clone(), result.clone());
                }
            }
        }
    }

    order
        .into_iter()
        .map(|id| best.remove(&id).expect("identity recorded on first sight"))
        .collect()
}

/// State of one recurring entity carried across batch boundaries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityState {
    /// Batch index where the entity was last observed
    pub last_seen_batch: usize,
    /// Free-form state description ("wounded", "travelling north", ...)
    pub state: String,
    /// Confidence of the latest observation (0.0-1.0)
    pub confidence: f64,
}

/// A hint handed to the next batch's provider call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuityHint {
    pub entity_id: String,
    pub state: String,
    pub confidence: f64,
    pub last_seen_batch: usize,
}

/// Continuity carried between adjacent batches of one job.
///
/// Owned by the job; created at job start, updated as batches complete,
/// discarded at job end. Never shared across jobs.
#[derive(Debug, Default)]
pub struct OverlapContext {
    /// Item identities from the tail of the previous batch
    previous_tail_items: Vec<String>,
    /// Entity id → latest observed state
    entity_states: HashMap<String, EntityState>,
}

impl OverlapContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an entity observation from a completed batch. Later
    /// observations replace earlier ones wholesale; entries are never
    /// mutated in place.
    pub fn record_entity(
        &mut self,
        batch_index: usize,
        entity_id: impl Into<String>,
        state: impl Into<String>,
        confidence: f64,
    ) {
        self.entity_states.insert(
            entity_id.into(),
            EntityState {
                last_seen_batch: batch_index,
                state: state.into(),
                confidence: confidence.clamp(0.0, 1.0),
            },
        );
    }

    /// Remember the tail items of the batch that just completed
    pub fn set_previous_tail(&mut self, items: Vec<String>) {
        self.previous_tail_items = items;
    }

    pub fn previous_tail(&self) -> &[String] {
        &self.previous_tail_items
    }

    /// Entities last seen within [`HINT_WINDOW_BATCHES`] of the given
    /// batch, sorted by entity id for deterministic output. Stale
    /// entries are excluded, not deleted; a later batch may still
    /// re-observe them.
    pub fn continuity_hints(&self, batch_index: usize) -> Vec<ContinuityHint> {
        let mut hints: Vec<ContinuityHint> = self
            .entity_states
            .iter()
            .filter(|(_, state)| state.last_seen_batch + HINT_WINDOW_BATCHES >= batch_index)
            .map(|(id, state)| ContinuityHint {
                entity_id: id.clone(),
                state: state.state.clone(),
                confidence: state.confidence,
                last_seen_batch: state.last_seen_batch,
            })
            .collect();
        hints.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
        hints
    }
}
