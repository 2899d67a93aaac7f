//! Static bearer token authentication
//!
//! Every protected route requires `Authorization: Bearer <token>` matching
//! the configured API token exactly. A rejected request never reaches the
//! handler, so no cache build or graph run is started for it.

use crate::error::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;

/// Authentication failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing Authorization header")]
    MissingAuthHeader,

    #[error("Invalid Authorization header format")]
    InvalidAuthHeader,

    #[error("Invalid access token")]
    InvalidToken,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let body = ApiError::unauthorized().with_details(self.to_string());
        (StatusCode::UNAUTHORIZED, Json(body)).into_response()
    }
}

/// Check the bearer token in `headers` against `expected`
pub fn check_bearer(headers: &HeaderMap, expected: &str) -> Result<(), AuthError> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::MissingAuthHeader)?
        .to_str()
        .map_err(|_| AuthError::InvalidAuthHeader)?;

    let token = auth_header
        .strip_prefix("Bearer ")
        .ok_or(AuthError::InvalidAuthHeader)?;

    // An unset server token must not accept an empty bearer.
    if expected.is_empty() || !bool::from(token.as_bytes().ct_eq(expected.as_bytes())) {
        return Err(AuthError::InvalidToken);
    }
    Ok(())
}

/// Middleware rejecting requests without the configured bearer token
pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    if let Err(e) = check_bearer(request.headers(), state.api_token()) {
        tracing::warn!(path = %request.uri().path(), reason = %e, "Rejected request");
        return Err(e);
    }
    Ok(next.run(request).await)
}
