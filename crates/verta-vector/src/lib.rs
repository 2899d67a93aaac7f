//! Verta Vector - Embeddings and review indexes
//!
//! Turns review documents into vectors through an embedding provider,
//! persists them as a flat per-product index, and answers nearest-neighbour
//! queries over a loaded index.

pub mod embedding;
pub mod index;

pub use embedding::{create_embedding_client, EmbeddingClient, OllamaEmbedding, OpenAiEmbedding};
pub use index::{cosine_similarity, rank_descending_by_cosine, IndexRetriever, ReviewIndex};
