//! Application state management

use crate::feedback::FeedbackSink;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use verta_core::config::AppConfig;
use verta_rag::ChatService;

/// Application state shared across handlers
pub struct AppState {
    /// Application configuration
    pub config: AppConfig,
    /// Retriever cache and conversation graph
    pub chat: Arc<ChatService>,
    /// Feedback backend for `/score`
    pub feedback: Arc<dyn FeedbackSink>,
    /// Server start time
    pub start_time: Instant,
    /// Request counter
    pub request_count: AtomicU64,
}

impl AppState {
    pub fn new(config: AppConfig, chat: Arc<ChatService>, feedback: Arc<dyn FeedbackSink>) -> Self {
        Self {
            config,
            chat,
            feedback,
            start_time: Instant::now(),
            request_count: AtomicU64::new(0),
        }
    }

    /// Increment request counter
    pub fn increment_requests(&self) -> u64 {
        self.request_count.fetch_add(1, Ordering::SeqCst)
    }

    /// Get total request count
    pub fn get_request_count(&self) -> u64 {
        self.request_count.load(Ordering::SeqCst)
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Token protected routes must present
    pub fn api_token(&self) -> &str {
        &self.config.auth.api_token
    }
}
