//! Bearer-token authentication.
//!
//! Token validation itself is an external collaborator (OAuth introspection
//! in production); this module owns the HTTP plumbing: extracting the bearer
//! token, calling the [`TokenVerifier`], and stashing the [`Principal`] in
//! request extensions for handlers.

use crate::error::RelayError;
use crate::state::AppState;
use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::Response;
use std::collections::HashMap;

/// Authenticated caller identity.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: String,
    pub email: String,
}

/// External token-validation boundary.
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Principal, RelayError>;
}

/// Fixed token-to-principal map, for local runs and tests.
#[derive(Debug, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Principal>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.tokens.insert(token.into(), principal);
        self
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Principal, RelayError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or(RelayError::Unauthorized)
    }
}

fn bearer_token(request: &Request) -> Result<&str, RelayError> {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(RelayError::Unauthorized)?;
    header
        .strip_prefix("Bearer ")
        .filter(|token| !token.is_empty())
        .ok_or(RelayError::Unauthorized)
}

/// Middleware validating the bearer token on every route behind it.
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, RelayError> {
    let token = bearer_token(&request)?;
    let principal = state.verifier.verify(token).await?;
    request.extensions_mut().insert(principal);
    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_verifier_round_trip() {
        let verifier = StaticTokenVerifier::new().with_token(
            "secret",
            Principal {
                user_id: "u1".into(),
                email: "jan@opgroeien.be".into(),
            },
        );
        let principal = verifier.verify("secret").await.unwrap();
        assert_eq!(principal.email, "jan@opgroeien.be");
        assert!(matches!(
            verifier.verify("wrong").await,
            Err(RelayError::Unauthorized)
        ));
    }

    #[test]
    fn bearer_extraction_rejects_malformed_headers() {
        let request = Request::builder()
            .header(header::AUTHORIZATION, "Basic abc")
            .body(axum::body::Body::empty())
            .unwrap();
        assert!(bearer_token(&request).is_err());

        let request = Request::builder().body(axum::body::Body::empty()).unwrap();
        assert!(bearer_token(&request).is_err());

        let request = Request::builder()
            .header(header::AUTHORIZATION, "Bearer tok-123")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(bearer_token(&request).unwrap(), "tok-123");
    }
}
