//! Route definitions

use crate::handlers::{chat, feedback, health, retriever};
use crate::middleware::require_bearer;
use crate::state::AppState;
use crate::ApiDoc;
use axum::{
    middleware,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use utoipa::OpenApi;

/// All routes; everything except the health check and API docs needs the bearer token
pub fn api_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let public_routes = Router::new()
        .route("/", get(health::health_check))
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }));

    let protected_routes = Router::new()
        .route("/initialize", get(retriever::initialize_handler))
        .route("/score", post(feedback::score_handler))
        .route("/dev-invoke", post(chat::invoke_handler))
        .route("/dev-stream", post(chat::stream_handler))
        .route_layer(middleware::from_fn_with_state(state, require_bearer));

    Router::new().merge(public_routes).merge(protected_routes)
}
