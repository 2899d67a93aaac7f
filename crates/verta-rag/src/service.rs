//! Request-level orchestration
//!
//! Resolves the cached retriever for a `(user, product)` pair and runs the
//! conversation graph against it under a per-request deadline.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use verta_core::{ProductMetadata, Result, Retriever, VertaError};
use verta_vector::IndexRetriever;

use crate::cache::{CacheEntry, RetrieverCache};
use crate::graph::{ConversationGraph, EventSink, GraphOutput};

/// Retriever and metadata resolved for one request
#[derive(Clone)]
pub struct PreparedContext {
    pub entry: Arc<CacheEntry>,
    pub retriever: Arc<dyn Retriever>,
}

impl PreparedContext {
    pub fn metadata(&self) -> Arc<ProductMetadata> {
        Arc::clone(&self.entry.metadata)
    }
}

/// Entry point used by the HTTP gateway and the CLI
pub struct ChatService {
    cache: Arc<RetrieverCache>,
    graph: Arc<ConversationGraph>,
    request_timeout: Duration,
}

impl ChatService {
    pub fn new(
        cache: Arc<RetrieverCache>,
        graph: Arc<ConversationGraph>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            cache,
            graph,
            request_timeout,
        }
    }

    pub fn cache(&self) -> &Arc<RetrieverCache> {
        &self.cache
    }

    /// Build (or reuse) the retriever for `(user_id, asin)`
    pub async fn initialize(&self, asin: &str, user_id: &str) -> Result<Arc<CacheEntry>> {
        self.cache.ensure(asin, user_id).await
    }

    /// Resolve the retriever, refusing entries whose storage has vanished
    pub async fn prepare(&self, asin: &str, user_id: &str) -> Result<PreparedContext> {
        let entry = self.cache.checkout(asin, user_id).await?;

        let retriever: Arc<dyn Retriever> = Arc::new(IndexRetriever::new(
            Arc::clone(&entry.index),
            self.cache.embedder(),
        ));
        Ok(PreparedContext { entry, retriever })
    }

    /// Answer a question synchronously
    pub async fn invoke(&self, question: &str, asin: &str, user_id: &str) -> Result<GraphOutput> {
        self.with_deadline(async {
            let context = self.prepare(asin, user_id).await?;
            self.graph
                .invoke(question, context.metadata(), context.retriever)
                .await
        })
        .await
    }

    /// Answer a question against a prepared context, reporting to `sink`
    pub async fn stream(
        &self,
        question: &str,
        context: PreparedContext,
        sink: EventSink,
    ) -> Result<GraphOutput> {
        self.with_deadline(async {
            self.graph
                .run(question, context.metadata(), context.retriever, &sink)
                .await
        })
        .await
    }

    async fn with_deadline<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.request_timeout, fut)
            .await
            .map_err(|_| {
                tracing::warn!(timeout_secs = self.request_timeout.as_secs(), "Request timed out");
                VertaError::Timeout(self.request_timeout.as_secs())
            })?
    }
}
