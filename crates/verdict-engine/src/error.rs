//! Error taxonomy for the scoring engine
//!
//! Only validation, rate-limit, breaker-open, timeout and total-aggregation
//! failures reach callers. Per-analyzer and per-item failures are absorbed
//! and represented as data.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Main error type for the engine
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// Malformed or oversized input, rejected before any work starts
    #[error("Validation error: {0}")]
    Validation(String),

    /// Caller exceeded its request quota
    #[error("Rate limit exceeded for '{caller}' ({limit} requests per {window:?}). Retry after {retry_after:?}")]
    RateLimited {
        caller: String,
        limit: u32,
        window: Duration,
        retry_after: Duration,
    },

    /// A dependency is isolated by its circuit breaker
    #[error("Circuit '{breaker}' is open. Retry after {retry_after:?}")]
    CircuitOpen {
        breaker: String,
        retry_after: Duration,
    },

    /// A bounded operation exceeded its deadline
    #[error("Operation '{operation}' timed out after {limit:?}")]
    Timeout { operation: String, limit: Duration },

    /// No usable analyzer verdicts for a request
    #[error("Aggregation failed: {reason} ({failed}/{attempted} analyzers failed)")]
    Aggregation {
        attempted: usize,
        failed: usize,
        reason: String,
    },

    /// The engine no longer accepts work
    #[error("Engine is shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Stable label used for metric tags and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::RateLimited { .. } => "rate_limit",
            EngineError::CircuitOpen { .. } => "circuit_open",
            EngineError::Timeout { .. } => "timeout",
            EngineError::Aggregation { .. } => "aggregation",
            EngineError::ShuttingDown => "shutting_down",
            EngineError::Config(_) => "config",
            EngineError::Internal(_) => "internal",
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::RateLimited { .. }
                | EngineError::CircuitOpen { .. }
                | EngineError::Timeout { .. }
                | EngineError::Aggregation { .. }
        )
    }

    /// Suggested delay before retrying, when the error carries one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EngineError::RateLimited { retry_after, .. } => Some(*retry_after),
            EngineError::CircuitOpen { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation(message.into())
    }
}

impl From<config::ConfigError> for EngineError {
    fn from(e: config::ConfigError) -> Self {
        EngineError::Config(e.to_string())
    }
}

impl From<prometheus::Error> for EngineError {
    fn from(e: prometheus::Error) -> Self {
        EngineError::Internal(format!("metrics registry: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_hints() {
        let err = EngineError::CircuitOpen {
            breaker: "system".to_string(),
            retry_after: Duration::from_secs(5),
        };
        assert!(err.is_retryable());
        assert_eq!(err.retry_after(), Some(Duration::from_secs(5)));
        assert_eq!(err.kind(), "circuit_open");

        let err = EngineError::validation("empty payload");
        assert!(!err.is_retryable());
        assert!(err.retry_after().is_none());
        assert!(err.to_string().contains("empty payload"));
    }
}
