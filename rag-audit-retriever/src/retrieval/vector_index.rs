//! Recall stage: nearest chunks to a query embedding.

use super::ScoredChunk;
use crate::error::{RetrieveError, Stage};
use crate::storage::{CombinedStore, EmbeddingStore};
use async_trait::async_trait;
use rag_audit_embed::EmbeddingProvider;
use std::sync::Arc;

/// Finds the chunks closest to a query.
#[async_trait]
pub trait EmbeddingIndex: Send + Sync {
    /// Up to `k` chunks, most similar first, scored by cosine similarity.
    ///
    /// An index with nothing to search returns an empty list.
    async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>, RetrieveError>;
}

/// Embedding index over the SQLite corpus store.
///
/// Embeds the query with the bi-encoder, then ranks every embedded chunk by
/// cosine similarity.
pub struct VectorIndex {
    store: Arc<dyn CombinedStore>,
    embedder: Arc<dyn EmbeddingProvider>,
}

impl VectorIndex {
    pub fn new(store: Arc<dyn CombinedStore>, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self { store, embedder }
    }
}

#[async_trait]
impl EmbeddingIndex for VectorIndex {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<ScoredChunk>, RetrieveError> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let embedded = self
            .store
            .count_embedded_chunks()
            .await
            .map_err(RetrieveError::Storage)?;
        if embedded == 0 {
            tracing::info!("Corpus has no embedded chunks, nothing to search");
            return Ok(Vec::new());
        }

        let query_embedding = self
            .embedder
            .embed_text(query)
            .await
            .map_err(|e| RetrieveError::upstream(Stage::Recall, e))?;

        let hits = self
            .store
            .search_chunks(query_embedding, k, None)
            .await
            .map_err(RetrieveError::Storage)?;

        tracing::debug!(
            provider = self.embedder.provider_name(),
            requested = k,
            found = hits.len(),
            "Vector search complete"
        );

        Ok(hits
            .into_iter()
            .map(|(chunk, score)| ScoredChunk { chunk, score })
            .collect())
    }
}
