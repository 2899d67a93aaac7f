//! Verta API Server

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use verta_api::{create_router, feedback::create_feedback_sink, state::AppState};
use verta_core::config::{AppConfig, LoggingConfig};
use verta_core::store::PgProductStore;
use verta_rag::{AgentClients, ChatService, ConversationGraph, PromptSet, RetrieverCache};
use verta_vector::create_embedding_client;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = match std::env::var("VERTA_CONFIG") {
        Ok(path) => AppConfig::from_file(path)?.with_env_override()?,
        Err(_) => AppConfig::from_env()?,
    };
    init_tracing(&config.logging);
    config.validate()?;

    // Retriever cache
    let store = Arc::new(PgProductStore::connect_lazy(&config.database)?);
    let embedder = create_embedding_client(&config.llm)?;
    let cache = Arc::new(RetrieverCache::new(&config.cache, store, embedder));
    cache.restore().await;

    // Conversation graph
    let prompts = Arc::new(PromptSet::load(config.prompts_file.as_deref())?);
    let graph = ConversationGraph::new(AgentClients::from_config(&config.llm)?, prompts)
        .with_retrieval_k(config.cache.retrieval_k);

    let chat = Arc::new(ChatService::new(
        Arc::clone(&cache),
        Arc::new(graph),
        config.server.request_timeout(),
    ));
    let feedback = create_feedback_sink(&config.feedback)?;

    let shutdown = CancellationToken::new();
    let sweeper = Arc::clone(&cache).spawn_sweeper(
        config.cache.sweep_interval(),
        config.cache.ttl(),
        shutdown.clone(),
    );

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let state = Arc::new(AppState::new(config, chat, feedback));
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Verta API Server starting on http://{}", addr);
    tracing::info!("OpenAPI document at http://{}/api-docs/openapi.json", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    sweeper.await?;
    tracing::info!("Server stopped");

    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "verta_api={level},verta_rag={level},verta_vector={level},verta_core={level},tower_http=info",
            level = logging.level
        )
        .into()
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_file(logging.include_location)
        .with_line_number(logging.include_location);

    if logging.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
        }
        _ = shutdown.cancelled() => {}
    }
    tracing::info!("Shutdown signal received");
}
