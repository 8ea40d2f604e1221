//! Common error types for Pageweave
//!
//! Provider adapters classify every failure into a closed [`ErrorKind`]
//! once, at the adapter boundary. The orchestration layer makes all of
//! its retry/failover decisions from that kind, never by re-inspecting
//! error message text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Common result type for Pageweave operations
pub type Result<T> = std::result::Result<T, Error>;

/// Closed classification of provider-call failures.
///
/// Produced exactly once by the provider adapter; consumed by the
/// retry executor (retryable vs terminal) and the fallback
/// coordinator (switch vs surface).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Provider rejected the call due to rate limiting
    RateLimit,
    /// Network-level failure (connection reset, DNS, etc.)
    Network,
    /// The call exceeded its deadline
    Timeout,
    /// Credentials rejected by the provider
    Authentication,
    /// Malformed or unacceptable request
    InvalidRequest,
    /// Provider refused the content
    ContentFilter,
    /// Request exceeded the provider's context window
    ContextLengthExceeded,
    /// Transient provider-side error (5xx and friends)
    TransientApiError,
    /// Unclassifiable failure
    Unknown,
}

impl ErrorKind {
    /// Whether a local retry against the same provider can succeed.
    ///
    /// Everything outside this set is terminal for the retry loop:
    /// invalid requests, auth failures, content filtering and
    /// context overflow cannot be fixed by waiting.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::Network
                | ErrorKind::Timeout
                | ErrorKind::TransientApiError
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Authentication => "authentication",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::ContentFilter => "content_filter",
            ErrorKind::ContextLengthExceeded => "context_length_exceeded",
            ErrorKind::TransientApiError => "transient_api_error",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// A classified failure from a model provider call
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("provider error ({kind}): {message}")]
pub struct ProviderError {
    /// Failure classification
    pub kind: ErrorKind,
    /// Human-readable detail from the adapter
    pub message: String,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// Common error types across Pageweave crates
#[derive(Debug, Error)]
pub enum Error {
    /// A provider call failed with a classified kind
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Circuit breaker is open for the operation class
    #[error("circuit open for class '{class}', retry after {remaining_ms} ms")]
    CircuitOpen { class: String, remaining_ms: u64 },

    /// Every configured provider was tried and failed
    #[error("all providers exhausted after {attempts} attempts ({switches} switches)")]
    AllProvidersExhausted { attempts: u32, switches: u32 },

    /// A stage's declared dependency did not complete successfully
    #[error("stage '{stage}' dependency '{dependency}' did not complete")]
    DependencyFailed { stage: String, dependency: String },

    /// The job was cancelled cooperatively
    #[error("job cancelled")]
    Cancelled,

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classified kind, where one applies.
    ///
    /// Circuit-open maps to no provider kind; the fallback coordinator
    /// treats it as switch-qualifying directly.
    pub fn provider_kind(&self) -> Option<ErrorKind> {
        match self {
            Error::Provider(e) => Some(e.kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::RateLimit.is_retryable());
        assert!(ErrorKind::Network.is_retryable());
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::TransientApiError.is_retryable());
    }

    #[test]
    fn test_terminal_kinds() {
        assert!(!ErrorKind::Authentication.is_retryable());
        assert!(!ErrorKind::InvalidRequest.is_retryable());
        assert!(!ErrorKind::ContentFilter.is_retryable());
        assert!(!ErrorKind::ContextLengthExceeded.is_retryable());
        assert!(!ErrorKind::Unknown.is_retryable());
    }

    #[test]
    fn test_provider_error_display() {
        let err = ProviderError::new(ErrorKind::RateLimit, "429 from upstream");
        assert_eq!(
            err.to_string(),
            "provider error (rate_limit): 429 from upstream"
        );
    }

    #[test]
    fn test_error_kind_serializes_stably() {
        let json = serde_json::to_string(&ErrorKind::ContextLengthExceeded).unwrap();
        assert_eq!(json, "\"ContextLengthExceeded\"");
    }
}
