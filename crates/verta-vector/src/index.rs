//! Flat review index
//!
//! A product has at most a few thousand reviews, so an exhaustive cosine scan
//! over an in-memory matrix is enough. The index is persisted as a single
//! JSON file inside its own directory.

use std::cmp::Ordering;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use verta_core::{Document, Result, Retriever, VertaError};

use crate::embedding::EmbeddingClient;

/// File name of the persisted index inside its directory
pub const INDEX_FILE: &str = "index.json";

/// Cosine similarity of two equal-length vectors.
///
/// Returns 0.0 when either vector has zero norm.
pub fn cosine_similarity(query: &[f32], candidate: &[f32]) -> Result<f32> {
    if query.is_empty() || candidate.is_empty() {
        return Err(VertaError::ValidationError(
            "Vectors must not be empty".to_string(),
        ));
    }
    if query.len() != candidate.len() {
        return Err(VertaError::ValidationError(format!(
            "Vector length mismatch: {} != {}",
            query.len(),
            candidate.len()
        )));
    }

    let mut dot = 0.0f32;
    let mut query_norm = 0.0f32;
    let mut candidate_norm = 0.0f32;
    for (q, c) in query.iter().zip(candidate) {
        dot += q * c;
        query_norm += q * q;
        candidate_norm += c * c;
    }

    let denom = query_norm.sqrt() * candidate_norm.sqrt();
    if denom <= f32::EPSILON {
        return Ok(0.0);
    }
    Ok(dot / denom)
}

/// Candidate indices paired with their score, best first
pub fn rank_descending_by_cosine(
    query: &[f32],
    candidates: &[Vec<f32>],
) -> Result<Vec<(usize, f32)>> {
    let mut scores = Vec::with_capacity(candidates.len());
    for (idx, candidate) in candidates.iter().enumerate() {
        scores.push((idx, cosine_similarity(query, candidate)?));
    }

    scores.sort_by(|left, right| right.1.partial_cmp(&left.1).unwrap_or(Ordering::Equal));
    Ok(scores)
}

/// Review documents and their embeddings for one product
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewIndex {
    /// Embedding model that produced the vectors
    pub model: String,
    pub dimension: usize,
    documents: Vec<Document>,
    vectors: Vec<Vec<f32>>,
}

impl ReviewIndex {
    /// Embed `documents` and build an index over them.
    ///
    /// Fails with `IndexBuildFailed` on an empty input, a provider error, or
    /// vectors of inconsistent dimension.
    pub async fn build(documents: Vec<Document>, embedder: &dyn EmbeddingClient) -> Result<Self> {
        if documents.is_empty() {
            return Err(VertaError::IndexBuildFailed(
                "No documents to index".to_string(),
            ));
        }

        let texts: Vec<String> = documents.iter().map(|d| d.page_content.clone()).collect();
        let vectors = embedder
            .embed_batch(&texts)
            .await
            .map_err(|e| VertaError::IndexBuildFailed(format!("Embedding failed: {e}")))?;

        Self::from_parts(embedder.model(), documents, vectors)
    }

    /// Assemble an index from precomputed vectors
    pub fn from_parts(
        model: impl Into<String>,
        documents: Vec<Document>,
        vectors: Vec<Vec<f32>>,
    ) -> Result<Self> {
        if documents.len() != vectors.len() {
            return Err(VertaError::IndexBuildFailed(format!(
                "{} documents but {} vectors",
                documents.len(),
                vectors.len()
            )));
        }

        let dimension = vectors.first().map(Vec::len).unwrap_or(0);
        if dimension == 0 || vectors.iter().any(|v| v.len() != dimension) {
            return Err(VertaError::IndexBuildFailed(
                "Embeddings have inconsistent or zero dimension".to_string(),
            ));
        }

        Ok(Self {
            model: model.into(),
            dimension,
            documents,
            vectors,
        })
    }

    /// Number of indexed documents
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    /// Indexed documents in insertion order
    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    /// Up to `k` documents closest to `query_vector`, best first
    pub fn search(&self, query_vector: &[f32], k: usize) -> Result<Vec<Document>> {
        if query_vector.len() != self.dimension {
            return Err(VertaError::ProviderError(format!(
                "Query embedding has dimension {}, index expects {}",
                query_vector.len(),
                self.dimension
            )));
        }

        let ranked = rank_descending_by_cosine(query_vector, &self.vectors)?;
        Ok(ranked
            .into_iter()
            .take(k)
            .map(|(idx, _)| self.documents[idx].clone())
            .collect())
    }

    /// Write the index into `dir`, creating it if needed
    pub async fn save(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            VertaError::StorageError(format!("Failed to create {}: {e}", dir.display()))
        })?;

        let bytes = serde_json::to_vec(self)
            .map_err(|e| VertaError::StorageError(format!("Failed to encode index: {e}")))?;

        let path = dir.join(INDEX_FILE);
        tokio::fs::write(&path, bytes).await.map_err(|e| {
            VertaError::StorageError(format!("Failed to write {}: {e}", path.display()))
        })?;

        tracing::debug!(path = %path.display(), documents = self.len(), "Saved review index");
        Ok(())
    }

    /// Read an index previously written by [`ReviewIndex::save`]
    pub async fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(INDEX_FILE);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                VertaError::UninitializedRetriever(format!(
                    "No index at {}",
                    dir.display()
                ))
            } else {
                VertaError::StorageError(format!("Failed to read {}: {e}", path.display()))
            }
        })?;

        serde_json::from_slice(&bytes)
            .map_err(|e| VertaError::StorageError(format!("Corrupt index {}: {e}", path.display())))
    }
}

/// [`Retriever`] over a loaded index, embedding queries with the same model
#[derive(Clone)]
pub struct IndexRetriever {
    index: Arc<ReviewIndex>,
    embedder: Arc<dyn EmbeddingClient>,
}

impl IndexRetriever {
    pub fn new(index: Arc<ReviewIndex>, embedder: Arc<dyn EmbeddingClient>) -> Self {
        Self { index, embedder }
    }
}

#[async_trait]
impl Retriever for IndexRetriever {
    async fn similarity_search(&self, query: &str, k: usize) -> Result<Vec<Document>> {
        let query_vector = self.embedder.embed(query).await?;
        let documents = self.index.search(&query_vector, k)?;
        tracing::debug!(k, returned = documents.len(), "Similarity search");
        Ok(documents)
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}
