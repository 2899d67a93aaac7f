//! Run traces and user feedback scoring
//!
//! When a request opts in with `log_langfuse`, the answered question is
//! recorded as a Langfuse trace whose id is the run id. Thumbs up/down votes
//! from `/score` are then attached to that trace through the
//! `POST /api/public/scores` endpoint. Without Langfuse credentials both are
//! only logged.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use verta_core::{FeedbackConfig, Result, VertaError};

/// Score name attached to every vote
pub const SCORE_NAME: &str = "user-feedback";

/// Trace name of one answered question
pub const TRACE_NAME: &str = "product-qa";

/// One answered question
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceRecord {
    /// Run id returned to the client
    pub id: String,
    pub name: &'static str,
    pub user_id: String,
    /// Retriever cache key, `"{user_id}-{parent_asin}"`
    pub session_id: String,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl TraceRecord {
    pub fn answered(
        run_id: &str,
        user_id: &str,
        session_id: impl Into<String>,
        parent_asin: &str,
        question: &str,
        answer: &str,
        followup_questions: &[String],
    ) -> Self {
        Self {
            id: run_id.to_string(),
            name: TRACE_NAME,
            user_id: user_id.to_string(),
            session_id: session_id.into(),
            input: serde_json::json!({ "question": question, "parent_asin": parent_asin }),
            output: serde_json::json!({
                "answer": answer,
                "followup_questions": followup_questions,
            }),
            timestamp: Utc::now(),
        }
    }
}

/// Body of `POST /api/public/ingestion`
#[derive(Debug, Serialize)]
struct IngestionBatch<'a> {
    batch: Vec<IngestionEvent<'a>>,
}

#[derive(Debug, Serialize)]
struct IngestionEvent<'a> {
    id: String,
    timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    kind: &'static str,
    body: &'a TraceRecord,
}

impl<'a> IngestionBatch<'a> {
    fn trace_create(trace: &'a TraceRecord) -> Self {
        Self {
            batch: vec![IngestionEvent {
                id: Uuid::new_v4().to_string(),
                timestamp: trace.timestamp,
                kind: "trace-create",
                body: trace,
            }],
        }
    }
}

/// Per-event outcome; the endpoint answers 207 even when events fail
#[derive(Debug, Default, Deserialize)]
struct IngestionResponse {
    #[serde(default)]
    errors: Vec<serde_json::Value>,
}

/// One vote on a run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackScore {
    /// `"{uuid}-{user_id}-{parent_asin}"`
    pub id: String,
    #[serde(rename = "traceId")]
    pub trace_id: String,
    pub name: &'static str,
    pub value: f64,
    #[serde(rename = "dataType")]
    pub data_type: &'static str,
}

impl FeedbackScore {
    pub fn boolean(run_id: &str, user_id: &str, parent_asin: &str, value: bool) -> Self {
        Self {
            id: format!("{}-{user_id}-{parent_asin}", Uuid::new_v4()),
            trace_id: run_id.to_string(),
            name: SCORE_NAME,
            value: if value { 1.0 } else { 0.0 },
            data_type: "BOOLEAN",
        }
    }
}

/// Destination for run traces and feedback scores
#[async_trait]
pub trait FeedbackSink: Send + Sync {
    async fn record(&self, score: &FeedbackScore) -> Result<()>;

    async fn record_trace(&self, trace: &TraceRecord) -> Result<()>;
}

/// Langfuse public API client
pub struct LangfuseFeedback {
    client: reqwest::Client,
    endpoint: String,
    ingestion_endpoint: String,
    public_key: String,
    secret_key: String,
}

impl LangfuseFeedback {
    pub fn new(
        host: &str,
        public_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| VertaError::ConfigError(format!("Failed to build HTTP client: {e}")))?;

        let host = host.trim_end_matches('/');
        Ok(Self {
            client,
            endpoint: format!("{host}/api/public/scores"),
            ingestion_endpoint: format!("{host}/api/public/ingestion"),
            public_key: public_key.into(),
            secret_key: secret_key.into(),
        })
    }
}

#[async_trait]
impl FeedbackSink for LangfuseFeedback {
    async fn record(&self, score: &FeedbackScore) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.public_key, Some(&self.secret_key))
            .json(score)
            .send()
            .await
            .map_err(|e| VertaError::ProviderError(format!("Feedback request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(VertaError::ProviderError(format!(
                "Feedback endpoint returned {status}: {body}"
            )));
        }

        tracing::info!(trace_id = %score.trace_id, id = %score.id, "Feedback recorded");
        Ok(())
    }

    async fn record_trace(&self, trace: &TraceRecord) -> Result<()> {
        let response = self
            .client
            .post(&self.ingestion_endpoint)
            .basic_auth(&self.public_key, Some(&self.secret_key))
            .json(&IngestionBatch::trace_create(trace))
            .send()
            .await
            .map_err(|e| VertaError::ProviderError(format!("Trace request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VertaError::ProviderError(format!(
                "Ingestion endpoint returned {status}: {body}"
            )));
        }

        let outcome: IngestionResponse = response.json().await.unwrap_or_default();
        if let Some(error) = outcome.errors.first() {
            return Err(VertaError::ProviderError(format!("Trace rejected: {error}")));
        }

        tracing::debug!(trace_id = %trace.id, session_id = %trace.session_id, "Trace recorded");
        Ok(())
    }
}

/// Logs votes without forwarding them
pub struct LoggingFeedback;

#[async_trait]
impl FeedbackSink for LoggingFeedback {
    async fn record(&self, score: &FeedbackScore) -> Result<()> {
        tracing::info!(
            trace_id = %score.trace_id,
            id = %score.id,
            value = score.value,
            "Feedback received (Langfuse not configured)"
        );
        Ok(())
    }

    async fn record_trace(&self, trace: &TraceRecord) -> Result<()> {
        tracing::info!(
            trace_id = %trace.id,
            user_id = %trace.user_id,
            session_id = %trace.session_id,
            "Run finished (Langfuse not configured)"
        );
        Ok(())
    }
}

/// Pick the sink for the configured backend
pub fn create_feedback_sink(config: &FeedbackConfig) -> Result<Arc<dyn FeedbackSink>> {
    match (
        &config.langfuse_host,
        &config.langfuse_public_key,
        &config.langfuse_secret_key,
    ) {
        (Some(host), Some(public_key), Some(secret_key)) => Ok(Arc::new(LangfuseFeedback::new(
            host,
            public_key.as_str(),
            secret_key.as_str(),
        )?)),
        _ => Ok(Arc::new(LoggingFeedback)),
    }
}
