//! Bearer token authentication for operator routes.

use std::sync::Arc;

use axum::{
    extract::{Query, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use subtle::ConstantTimeEq;

use crate::server::error::ApiError;

/// Shared auth state injected via axum middleware state.
#[derive(Clone)]
pub struct AuthState {
    token: Arc<SecretString>,
}

impl AuthState {
    pub fn new(token: SecretString) -> Self {
        Self {
            token: Arc::new(token),
        }
    }

    fn accepts(&self, candidate: &str) -> bool {
        let expected = self.token.expose_secret().as_bytes();
        !expected.is_empty() && bool::from(candidate.as_bytes().ct_eq(expected))
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Validates the bearer token from the header or the `token` query param.
///
/// `EventSource` cannot set headers, so SSE clients pass `?token=xxx`.
pub async fn auth_middleware(
    State(auth): State<AuthState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let from_header = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| auth.accepts(token));
    if from_header {
        return next.run(request).await;
    }

    // Percent-decoded; a malformed query counts as no token.
    let from_query = Query::<TokenQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(query)| query.token)
        .is_some_and(|token| auth.accepts(&token));
    if from_query {
        return next.run(request).await;
    }

    ApiError::unauthorized("invalid or missing auth token").into_response()
}
