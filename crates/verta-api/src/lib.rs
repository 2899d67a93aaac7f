//! Verta API - HTTP gateway
//!
//! Serves product questions over JSON and server-sent events, behind a
//! static bearer token.

pub mod error;
pub mod feedback;
pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod state;

use axum::{http::HeaderValue, Router};
use state::AppState;
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;

/// OpenAPI document served at `/api-docs/openapi.json`
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Verta API",
        description = "Product question answering over customer reviews"
    ),
    paths(
        handlers::health::health_check,
        handlers::retriever::initialize_handler,
        handlers::feedback::score_handler,
        handlers::chat::invoke_handler,
        handlers::chat::stream_handler
    ),
    components(schemas(
        error::ApiError,
        handlers::health::HealthResponse,
        handlers::retriever::InitializeResponse,
        handlers::feedback::ScoreRequest,
        handlers::feedback::ScoreResponse,
        handlers::chat::ChatRequest,
        handlers::chat::ChatResponse
    )),
    tags(
        (name = "health", description = "Liveness"),
        (name = "retriever", description = "Retriever cache"),
        (name = "chat", description = "Question answering"),
        (name = "feedback", description = "User feedback")
    )
)]
pub struct ApiDoc;

/// Build the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config.server.cors_origins);

    Router::new()
        .merge(routes::api_routes(Arc::clone(&state)))
        .layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            middleware::request_log_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Permissive when no origins are configured
fn cors_layer(origins: &[String]) -> CorsLayer {
    if origins.is_empty() {
        return CorsLayer::permissive();
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(allowed)
        .allow_methods(Any)
        .allow_headers(Any)
}
