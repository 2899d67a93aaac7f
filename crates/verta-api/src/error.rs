//! API error handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use verta_core::VertaError;

/// API error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// Error code
    pub code: String,
    /// Human-readable message
    pub message: String,
    /// Additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BAD_REQUEST", message)
    }

    pub fn unauthorized() -> Self {
        Self::new("UNAUTHORIZED", "Invalid or missing access token")
    }

    pub fn internal_error() -> Self {
        Self::new("INTERNAL_ERROR", "Internal server error")
    }
}

/// Application error type
#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    /// Cache claims the key but its files are gone
    Uninitialized(String),
    Unauthorized,
    Timeout(u64),
    Internal(String),
    Database(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ApiError::bad_request(msg)),
            AppError::Uninitialized(msg) => (
                StatusCode::BAD_REQUEST,
                ApiError::new("RETRIEVER_NOT_INITIALIZED", "Retriever not initialized")
                    .with_details(msg),
            ),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, ApiError::unauthorized()),
            AppError::Timeout(secs) => (
                StatusCode::GATEWAY_TIMEOUT,
                ApiError::new("TIMEOUT", format!("Request exceeded {secs}s")),
            ),
            AppError::Internal(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError::internal_error().with_details(msg),
            ),
            AppError::Database(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                ApiError::new("DATABASE_ERROR", "Database operation failed").with_details(msg),
            ),
        };

        (status, Json(error)).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<VertaError> for AppError {
    fn from(err: VertaError) -> Self {
        match err {
            VertaError::Unauthorized => AppError::Unauthorized,
            VertaError::ValidationError(msg) => AppError::BadRequest(msg),
            VertaError::DataUnavailable(msg) => {
                AppError::BadRequest(format!("Data unavailable: {msg}"))
            }
            VertaError::UninitializedRetriever(msg) => AppError::Uninitialized(msg),
            VertaError::DatabaseError(msg) => AppError::Database(msg),
            VertaError::Timeout(secs) => AppError::Timeout(secs),
            VertaError::IndexBuildFailed(msg) => {
                AppError::Internal(format!("Index build failed: {msg}"))
            }
            VertaError::RoutingError(msg) => AppError::Internal(format!("Routing error: {msg}")),
            VertaError::ProviderError(msg) => AppError::Internal(format!("LLM error: {msg}")),
            other => AppError::Internal(other.to_string()),
        }
    }
}
