//! Model provider capability and wire types
//!
//! The orchestration engine consumes exactly one capability from its
//! environment: [`ModelProvider`]. Concrete adapters (Gemini, OpenAI,
//! Anthropic, ...) live outside this workspace; they are invoked here
//! through this trait and must classify every failure into an
//! [`ErrorKind`](crate::error::ErrorKind) before it crosses the
//! boundary.
//!
//! # Example
//! ```rust,ignore
//! use pageweave_common::provider::{ModelProvider, ProviderRequest, ProviderResponse};
//!
//! pub struct GeminiAdapter { /* http client, key, ... */ }
//!
//! #[async_trait::async_trait]
//! impl ModelProvider for GeminiAdapter {
//!     fn id(&self) -> &str { "gemini" }
//!     fn is_usable(&self) -> bool { self.has_key() }
//!
//!     async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError> {
//!         // build prompt, POST, parse, classify failures
//!     }
//! }
//! ```

use crate::error::ProviderError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One provider call's worth of work: a stage applied to a batch of
/// page items, plus continuity hints carried over from earlier batches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    /// Job this call belongs to
    pub job_id: Uuid,
    /// Stage being executed (e.g. "layout", "transcription")
    pub stage_id: String,
    /// Zero-based batch index within the job
    pub batch_index: usize,
    /// Items in this batch, in input order
    pub items: Vec<PageItem>,
    /// Continuity hints from adjacent batches (recurring entities etc.)
    pub context_hints: Vec<String>,
}

/// A single input item (one page scan) addressed by stable identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageItem {
    /// Stable identity, preserved across overlapping batches
    pub id: String,
    /// Zero-based position in the job's input order
    pub index: usize,
    /// Opaque payload handed to the provider (data URL, reference, ...)
    pub payload: String,
}

/// Provider response for one request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    /// Opaque model output for the whole batch (consumed downstream)
    pub payload: String,
    /// Per-item results with provider-reported confidence
    pub items: Vec<ItemResult>,
    /// Token accounting for this call
    pub usage: TokenUsage,
}

/// Confidence-scored result for one item
///
/// Identity is the merge key when overlapping batches produce the same
/// item; the higher-confidence duplicate wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemResult {
    /// Identity of the item this result describes
    pub item_id: String,
    /// Opaque per-item output
    pub payload: String,
    /// Confidence score (0.0-1.0), clamped on construction
    pub confidence: f64,
}

impl ItemResult {
    pub fn new(item_id: impl Into<String>, payload: impl Into<String>, confidence: f64) -> Self {
        Self {
            item_id: item_id.into(),
            payload: payload.into(),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// Token counts reported by the provider for one call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// External model endpoint capability
///
/// Implementations must be safe to share across jobs (`Send + Sync`);
/// the engine never holds a call open across a cancellation point.
#[async_trait::async_trait]
pub trait ModelProvider: Send + Sync {
    /// Stable provider identifier for history and usage attribution
    fn id(&self) -> &str;

    /// Whether the provider is currently configured and willing to
    /// accept calls (e.g. has credentials, not administratively down).
    fn is_usable(&self) -> bool;

    /// Execute one call. Cancelable: the engine may drop the future.
    async fn invoke(&self, request: &ProviderRequest) -> Result<ProviderResponse, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_result_clamps_confidence() {
        assert_eq!(ItemResult::new("p1", "x", 1.7).confidence, 1.0);
        assert_eq!(ItemResult::new("p1", "x", -0.3).confidence, 0.0);
        assert_eq!(ItemResult::new("p1", "x", 0.42).confidence, 0.42);
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage::new(1200, 340);
        assert_eq!(usage.total(), 1540);
    }
}
