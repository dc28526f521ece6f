//! Request authentication.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use std::sync::Arc;

use crate::AppState;
use crate::error::ApiError;

/// Decides whether a request may read or change pipeline state.
pub trait AuthValidator: Send + Sync {
    fn is_authenticated(&self, headers: &HeaderMap) -> bool;
}

/// Lets every request through.
pub struct NoAuth;

impl AuthValidator for NoAuth {
    fn is_authenticated(&self, _headers: &HeaderMap) -> bool {
        true
    }
}

/// Requires `Authorization: Bearer <token>`.
pub struct TokenValidator {
    token: String,
}

impl TokenValidator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl AuthValidator for TokenValidator {
    fn is_authenticated(&self, headers: &HeaderMap) -> bool {
        headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .is_some_and(|token| token == self.token)
    }
}

/// Token validation when a token is configured, open access otherwise.
pub fn validator(token: Option<String>) -> Arc<dyn AuthValidator> {
    match token {
        Some(token) => Arc::new(TokenValidator::new(token)),
        None => Arc::new(NoAuth),
    }
}

/// Extractor that rejects unauthenticated requests with 401.
pub struct Authenticated;

impl FromRequestParts<AppState> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        if state.auth.is_authenticated(&parts.headers) {
            Ok(Authenticated)
        } else {
            Err(ApiError::Unauthorized("not authorized".to_string()))
        }
    }
}
