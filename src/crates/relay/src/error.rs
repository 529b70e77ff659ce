//! Service error type and HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Errors surfaced by the HTTP layer.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Missing or invalid bearer token.
    #[error("authentication required")]
    Unauthorized,

    /// Principal is not allowed to touch this org/project/flow.
    #[error("access denied: {0}")]
    AuthDenied(String),

    /// Unknown thread or resource.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed request.
    #[error("validation error: {0}")]
    Validation(String),

    /// Checkpoint or registry persistence failure.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Anything else.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Error-kind tag included in error payloads and `error` events.
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::Unauthorized => "auth_denied",
            RelayError::AuthDenied(_) => "auth_denied",
            RelayError::NotFound(_) => "not_found",
            RelayError::Validation(_) => "invalid_input",
            RelayError::Persistence(_) => "persistence",
            RelayError::Internal(_) => "internal",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            RelayError::Unauthorized => StatusCode::UNAUTHORIZED,
            RelayError::AuthDenied(_) => StatusCode::FORBIDDEN,
            RelayError::NotFound(_) => StatusCode::NOT_FOUND,
            RelayError::Validation(_) => StatusCode::BAD_REQUEST,
            RelayError::Persistence(_) | RelayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.to_string(),
            "error_type": self.kind(),
        }));
        (self.status(), body).into_response()
    }
}

impl From<sqlx::Error> for RelayError {
    fn from(err: sqlx::Error) -> Self {
        RelayError::Persistence(err.to_string())
    }
}

impl From<flowgraph_checkpoint::CheckpointError> for RelayError {
    fn from(err: flowgraph_checkpoint::CheckpointError) -> Self {
        RelayError::Persistence(err.to_string())
    }
}

impl From<flowgraph_core::GraphError> for RelayError {
    fn from(err: flowgraph_core::GraphError) -> Self {
        RelayError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        RelayError::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for RelayError {
    fn from(err: anyhow::Error) -> Self {
        RelayError::Internal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_match_error_kinds() {
        assert_eq!(RelayError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            RelayError::AuthDenied("x".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            RelayError::NotFound("t".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RelayError::Validation("v".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RelayError::Internal("i".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
