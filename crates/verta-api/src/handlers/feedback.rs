//! Feedback scoring handler

use crate::error::AppError;
use crate::feedback::FeedbackScore;
use crate::state::AppState;
use axum::{extract::State, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::ToSchema;

/// Vote on a previous answer
#[derive(Debug, Deserialize, ToSchema)]
pub struct ScoreRequest {
    /// `run_id` returned by `/dev-invoke` or `/dev-stream`
    pub run_id: String,
    pub user_id: String,
    pub parent_asin: String,
    /// Thumbs up (`true`) or down (`false`)
    pub value: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ScoreResponse {
    #[schema(example = "Feedback Successful")]
    pub status: String,
    pub trace_id: String,
}

/// Record user feedback for a run
#[utoipa::path(
    post,
    path = "/score",
    tag = "feedback",
    request_body = ScoreRequest,
    responses(
        (status = 200, description = "Feedback recorded", body = ScoreResponse),
        (status = 401, description = "Invalid or missing token", body = crate::error::ApiError),
        (status = 500, description = "Feedback backend failed", body = crate::error::ApiError)
    )
)]
pub async fn score_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ScoreRequest>,
) -> Result<impl IntoResponse, AppError> {
    let score = FeedbackScore::boolean(&req.run_id, &req.user_id, &req.parent_asin, req.value);

    if let Err(e) = state.feedback.record(&score).await {
        tracing::error!(run_id = %req.run_id, error = %e, "Error scoring trace");
        return Err(AppError::Internal(e.to_string()));
    }

    Ok(Json(ScoreResponse {
        status: "Feedback Successful".to_string(),
        trace_id: req.run_id,
    }))
}
