//! Verta RAG - retriever cache and conversation graph
//!
//! A question about a product runs through a small agent graph:
//! a metadata summary, a Supervisor that decides whether more review context
//! is needed, retrieval from the per-user review index, answer generation
//! and follow-up suggestions.
//!
//! - [`cache`]: per-`(user_id, parent_asin)` review index with single-flight
//!   builds and TTL eviction
//! - [`graph`]: node routing and the run loop
//! - [`service`]: request deadline and wiring of the two

pub mod cache;
pub mod graph;
pub mod llm;
pub mod prompts;
pub mod service;

#[cfg(test)]
mod test_support;

pub use cache::{
    CacheEntry, CacheKey, CacheStats, CacheStatsReport, EvictionReport, RestoreReport, RetrieverCache,
};
pub use graph::{
    AgentClients, ConversationGraph, Datasource, EventSink, GraphEvent, GraphOutput, NodeId,
    NodeOutput,
};
pub use llm::{create_llm_client, OllamaClient, OpenAiClient};
pub use prompts::{PromptBuilder, PromptSet};
pub use service::{ChatService, PreparedContext};
