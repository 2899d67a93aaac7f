//! Retriever pre-warming

use crate::error::AppError;
use crate::state::AppState;
use axum::{
    extract::{Query, State},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use utoipa::{IntoParams, ToSchema};

/// `/initialize` query parameters
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct InitializeParams {
    /// Product parent ASIN
    pub asin: String,
    /// Requesting user
    pub user_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct InitializeResponse {
    #[schema(example = "retriever initialized")]
    pub status: String,
    pub asin: String,
    pub user_id: String,
}

/// Build (or reuse) the review retriever for a user and product
#[utoipa::path(
    get,
    path = "/initialize",
    tag = "retriever",
    params(InitializeParams),
    responses(
        (status = 200, description = "Retriever ready", body = InitializeResponse),
        (status = 400, description = "Invalid ids or no product data", body = crate::error::ApiError),
        (status = 401, description = "Invalid or missing token", body = crate::error::ApiError),
        (status = 500, description = "Index build failed", body = crate::error::ApiError)
    )
)]
pub async fn initialize_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<InitializeParams>,
) -> Result<impl IntoResponse, AppError> {
    tracing::info!(asin = %params.asin, user_id = %params.user_id, "Initializing retriever");

    state.chat.initialize(&params.asin, &params.user_id).await?;

    Ok(Json(InitializeResponse {
        status: "retriever initialized".to_string(),
        asin: params.asin,
        user_id: params.user_id,
    }))
}
