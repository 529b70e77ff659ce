//! Typed failure kinds for gateway calls.

use thiserror::Error;

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Failure kinds surfaced by the gateway.
///
/// Only [`RateLimited`](GatewayError::RateLimited),
/// [`Timeout`](GatewayError::Timeout) and
/// [`Upstream`](GatewayError::Upstream) are retried; cancellation and
/// invalid input are terminal.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The upstream rejected the call for rate reasons.
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    /// The call did not finish within its (dynamic) timeout.
    #[error("request timed out after {seconds}s")]
    Timeout {
        /// Timeout that was applied.
        seconds: u64,
    },

    /// The caller's thread was cancelled; no retries follow.
    #[error("call cancelled")]
    Cancelled,

    /// Transient upstream failure (unavailable, connection reset).
    #[error("upstream unavailable: {0}")]
    Upstream(String),

    /// The request itself is malformed; retrying cannot help.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl GatewayError {
    /// Whether the retry envelope may try again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GatewayError::RateLimited(_) | GatewayError::Timeout { .. } | GatewayError::Upstream(_)
        )
    }

    /// Short kind tag used in logs and error events.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::RateLimited(_) => "rate_limit",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::Cancelled => "cancelled",
            GatewayError::Upstream(_) => "upstream_unavailable",
            GatewayError::InvalidInput(_) => "invalid_input",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds_are_retryable() {
        assert!(GatewayError::RateLimited("429".into()).is_retryable());
        assert!(GatewayError::Timeout { seconds: 600 }.is_retryable());
        assert!(GatewayError::Upstream("reset".into()).is_retryable());
    }

    #[test]
    fn terminal_kinds_are_not() {
        assert!(!GatewayError::Cancelled.is_retryable());
        assert!(!GatewayError::InvalidInput("empty".into()).is_retryable());
    }

    #[test]
    fn kind_tags_match_error_vocabulary() {
        assert_eq!(GatewayError::Timeout { seconds: 1 }.kind(), "timeout");
        assert_eq!(GatewayError::Cancelled.kind(), "cancelled");
    }
}
