//! Job event types for progress reporting
//!
//! The engine emits these over an `mpsc` channel when one is attached;
//! callers forward them to whatever surface they like (SSE, log, UI).
//! Emission is best-effort: a full or closed channel never blocks or
//! fails the job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Orchestration job events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobEvent {
    /// Job accepted and planned
    JobStarted {
        job_id: Uuid,
        total_items: usize,
        total_batches: usize,
        timestamp: DateTime<Utc>,
    },

    /// Batch execution started
    BatchStarted {
        job_id: Uuid,
        batch_index: usize,
        total_batches: usize,
        /// Inclusive item range covered by this batch
        start: usize,
        end: usize,
        timestamp: DateTime<Utc>,
    },

    /// One stage finished (success or failure) within a batch
    StageCompleted {
        job_id: Uuid,
        batch_index: usize,
        stage_id: String,
        success: bool,
        duration_ms: u64,
        /// Completed stages / registered stages for this batch, 0-100
        progress_percent: f64,
        timestamp: DateTime<Utc>,
    },

    /// A provider call is being retried after a transient failure
    RetryScheduled {
        job_id: Uuid,
        stage_id: String,
        provider_id: String,
        attempt: u32,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Failover switched to another provider
    ProviderSwitched {
        job_id: Uuid,
        stage_id: String,
        from_provider: String,
        to_provider: String,
        switches_used: u32,
        timestamp: DateTime<Utc>,
    },

    /// Batch fully processed
    BatchCompleted {
        job_id: Uuid,
        batch_index: usize,
        total_batches: usize,
        timestamp: DateTime<Utc>,
    },

    /// Job finished with all batches merged
    JobCompleted {
        job_id: Uuid,
        batches_processed: usize,
        timestamp: DateTime<Utc>,
    },

    /// Job stopped on a terminal failure
    JobFailed {
        job_id: Uuid,
        batch_index: Option<usize>,
        stage_id: Option<String>,
        message: String,
        /// Whether any stage completed before the failure point
        partial_results: bool,
        timestamp: DateTime<Utc>,
    },

    /// Job stopped by cooperative cancellation
    JobCancelled {
        job_id: Uuid,
        batches_completed: usize,
        timestamp: DateTime<Utc>,
    },
}

impl JobEvent {
    /// Job this event belongs to
    pub fn job_id(&self) -> Uuid {
        match self {
            JobEvent::JobStarted { job_id, .. }
            | JobEvent::BatchStarted { job_id, .. }
            | JobEvent::StageCompleted { job_id, .. }
            | JobEvent::RetryScheduled { job_id, .. }
            | JobEvent::ProviderSwitched { job_id, .. }
            | JobEvent::BatchCompleted { job_id, .. }
            | JobEvent::JobCompleted { job_id, .. }
            | JobEvent::JobFailed { job_id, .. }
            | JobEvent::JobCancelled { job_id, .. } => *job_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = JobEvent::JobStarted {
            job_id: Uuid::nil(),
            total_items: 100,
            total_batches: 10,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "JobStarted");
        assert_eq!(json["total_batches"], 10);
    }

    #[test]
    fn test_job_id_accessor() {
        let id = Uuid::new_v4();
        let event = JobEvent::JobCancelled {
            job_id: id,
            batches_completed: 3,
            timestamp: Utc::now(),
        };
        assert_eq!(event.job_id(), id);
    }
}
