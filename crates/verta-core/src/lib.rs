//! Verta Core - Domain models, traits, and shared types
//!
//! This crate defines the core abstractions used throughout Verta:
//! - Product models (metadata rows, reviews, retrieved documents)
//! - Common error types
//! - Shared traits for language models, retrievers, and the product store
//! - Configuration management
//! - Product data access (PostgreSQL)

pub mod config;
pub mod store;

pub use config::{
    AgentModels, AppConfig, AuthConfig, CacheConfig, ConfigError, DatabaseConfig, FeedbackConfig,
    LlmConfig, LlmProvider, LoggingConfig, ServerConfig,
};
pub use store::{PgProductStore, ProductRecord, ProductStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Core error types for Verta operations
#[derive(Error, Debug)]
pub enum VertaError {
    #[error("Unauthorized")]
    Unauthorized,

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Data unavailable: {0}")]
    DataUnavailable(String),

    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Index build failed: {0}")]
    IndexBuildFailed(String),

    #[error("Retriever not initialized: {0}")]
    UninitializedRetriever(String),

    #[error("Routing error: {0}")]
    RoutingError(String),

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    #[error("Request cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VertaError {
    /// Rebuild an owned error from a shared one.
    ///
    /// Single-flight caches hand the same failure to every waiter behind an
    /// `Arc`; each caller still needs its own value to propagate.
    pub fn from_shared(err: &VertaError) -> Self {
        match err {
            Self::Unauthorized => Self::Unauthorized,
            Self::ValidationError(m) => Self::ValidationError(m.clone()),
            Self::DataUnavailable(m) => Self::DataUnavailable(m.clone()),
            Self::DatabaseError(m) => Self::DatabaseError(m.clone()),
            Self::IndexBuildFailed(m) => Self::IndexBuildFailed(m.clone()),
            Self::UninitializedRetriever(m) => Self::UninitializedRetriever(m.clone()),
            Self::RoutingError(m) => Self::RoutingError(m.clone()),
            Self::ProviderError(m) => Self::ProviderError(m.clone()),
            Self::StorageError(m) => Self::StorageError(m.clone()),
            Self::Timeout(secs) => Self::Timeout(*secs),
            Self::Cancelled(m) => Self::Cancelled(m.clone()),
            Self::ConfigError(m) => Self::ConfigError(m.clone()),
            Self::Other(e) => Self::Other(anyhow::anyhow!(e.to_string())),
        }
    }
}

pub type Result<T> = std::result::Result<T, VertaError>;

// ============================================================================
// Product Models
// ============================================================================

/// One product's metadata row (`metadata` table)
///
/// Text columns are kept as free-form strings: the ETL loads lists and
/// structured blobs as their textual representation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProductMetadata {
    pub parent_asin: String,
    pub main_category: Option<String>,
    pub title: Option<String>,
    pub average_rating: Option<f64>,
    pub rating_number: Option<i64>,
    pub features: Option<String>,
    pub description: Option<String>,
    pub price: Option<String>,
    pub store: Option<String>,
    pub categories: Option<String>,
    pub details: Option<String>,
}

impl ProductMetadata {
    /// Create an empty metadata row for a product
    pub fn new(parent_asin: impl Into<String>) -> Self {
        Self {
            parent_asin: parent_asin.into(),
            ..Default::default()
        }
    }

    /// Set the product title
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    /// Structured details blob with braces swapped for brackets.
    ///
    /// The blob is JSON-ish text; braces inside it must never be read as
    /// template placeholders by the prompt renderer.
    pub fn normalized_details(&self) -> String {
        self.details
            .as_deref()
            .unwrap_or_default()
            .replace('{', "[")
            .replace('}', "]")
    }
}

/// One customer review (`userreviews` table)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub parent_asin: String,
    pub asin: Option<String>,
    pub rating: Option<f64>,
    pub title: Option<String>,
    pub text: Option<String>,
    pub user_id: Option<String>,
    pub timestamp: Option<String>,
    pub helpful_vote: Option<i64>,
    pub verified_purchase: Option<bool>,
}

impl Review {
    /// Review text if present and not blank
    pub fn content(&self) -> Option<&str> {
        self.text.as_deref().filter(|t| !t.trim().is_empty())
    }

    /// Convert into a retrievable document; `None` when the review has no text.
    pub fn into_document(self) -> Option<Document> {
        let content = self.content()?.to_string();
        let mut doc = Document::new(content)
            .with_metadata("parent_asin", self.parent_asin)
            .with_metadata("source", "Review");

        if let Some(asin) = self.asin {
            doc = doc.with_metadata("asin", asin);
        }
        if let Some(title) = self.title {
            doc = doc.with_metadata("title", title);
        }
        if let Some(rating) = self.rating {
            doc = doc.with_metadata("rating", rating);
        }
        if let Some(ts) = self.timestamp {
            doc = doc.with_metadata("timestamp", ts);
        }
        if let Some(votes) = self.helpful_vote {
            doc = doc.with_metadata("helpful_vote", votes);
        }
        if let Some(verified) = self.verified_purchase {
            doc = doc.with_metadata("verified_purchase", verified);
        }
        Some(doc)
    }
}

// ============================================================================
// Documents
// ============================================================================

/// A content fragment handed between retrievers and agents
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Text content
    pub page_content: String,

    /// Free-form provenance and attributes
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Document {
    /// Create a document with no metadata
    pub fn new(page_content: impl Into<String>) -> Self {
        Self {
            page_content: page_content.into(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Add a metadata attribute
    pub fn with_metadata(
        mut self,
        key: impl Into<String>,
        value: impl Into<serde_json::Value>,
    ) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Create a document tagged with a provenance source
    pub fn with_source(page_content: impl Into<String>, source: &str) -> Self {
        Self::new(page_content).with_metadata("source", source)
    }

    /// Provenance tag, if any
    pub fn source(&self) -> Option<&str> {
        self.metadata.get("source").and_then(|v| v.as_str())
    }
}

/// A generated answer and its generation metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Answer {
    /// Final response text
    pub content: String,

    /// Number of streamed chunks received from the model
    pub token_count: usize,

    /// Wall-clock generation time in milliseconds
    pub elapsed_ms: u64,

    /// When generation finished
    pub generated_at: DateTime<Utc>,
}

// ============================================================================
// Traits
// ============================================================================

/// One model call: an optional system message followed by the user turn
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prompt {
    pub system: Option<String>,
    pub user: String,
}

impl Prompt {
    /// User turn only
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            system: None,
            user: text.into(),
        }
    }

    /// System context plus user turn; an empty system text is dropped
    pub fn with_system(system: impl Into<String>, user: impl Into<String>) -> Self {
        let system = system.into();
        Self {
            system: (!system.trim().is_empty()).then_some(system),
            user: user.into(),
        }
    }

    /// Both parts as one text, for providers without a system role
    pub fn flatten(&self) -> String {
        match &self.system {
            Some(system) => format!("{system}\n\n{}", self.user),
            None => self.user.clone(),
        }
    }
}

/// JSON Schema a structured completion must satisfy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseSchema {
    /// Schema name reported to the provider
    pub name: String,
    pub schema: serde_json::Value,
}

/// Trait for LLM clients
#[async_trait::async_trait]
pub trait LlmClient: Send + Sync {
    /// Generate a response
    async fn generate(&self, prompt: &Prompt) -> Result<String>;

    /// Generate a streaming response
    async fn generate_stream(
        &self,
        prompt: &Prompt,
    ) -> Result<futures::stream::BoxStream<'static, Result<String>>>;

    /// Generate a JSON response constrained to `schema`.
    ///
    /// Providers without constrained decoding fall back to a plain
    /// completion; callers still validate the reply.
    async fn generate_structured(
        &self,
        prompt: &Prompt,
        _schema: &ResponseSchema,
    ) -> Result<String> {
        self.generate(prompt).await
    }

    /// Model name for logging
    fn model(&self) -> &str;
}

/// Nearest-neighbour search over a fixed document collection
#[async_trait::async_trait]
pub trait Retriever: Send + Sync {
    /// Return up to `k` documents ranked by similarity to `query`
    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<Document>>;

    /// Number of documents in the collection
    fn len(&self) -> usize;

    /// Whether the collection is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// Tests
// ============================================================================
