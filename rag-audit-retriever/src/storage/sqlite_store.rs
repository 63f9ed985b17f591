//! SQLite implementation of the storage traits
//!
//! [`SqliteStore`] adapts [`AuditIndex`] to the trait interfaces and does the
//! vector math SQLite cannot: similarity search loads every embedded chunk
//! and ranks by cosine similarity in memory.

use super::{
    Chunk, ChunkFilter, ChunkId, ChunkMetadata, ChunkStore, CombinedStore, CorpusStats,
    EmbeddingStore, ModeAggregate, RunStore,
};
use crate::evaluation::{EvaluationRun, RunFilter, RunId, RunOrder};
use crate::storage::AuditIndex;
use anyhow::Result;
use async_trait::async_trait;
use half::f16;

/// SQLite-based implementation of every storage trait.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    index: AuditIndex,
}

impl SqliteStore {
    pub fn new(index: AuditIndex) -> Self {
        Self { index }
    }

    pub fn index(&self) -> &AuditIndex {
        &self.index
    }
}

#[async_trait]
impl ChunkStore for SqliteStore {
    async fn insert_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<ChunkId>> {
        self.index.upsert_chunks(&chunks).await
    }

    async fn get_chunk(&self, id: ChunkId) -> Result<Option<Chunk>> {
        self.index.get_chunk_by_id(id).await
    }

    async fn list_chunks(&self, filter: ChunkFilter) -> Result<Vec<ChunkMetadata>> {
        self.index.list_chunk_metadata(&filter).await
    }

    async fn get_all_chunks(&self) -> Result<Vec<Chunk>> {
        self.index.get_all_chunks().await
    }

    async fn search_text(&self, search_term: &str, case_sensitive: bool) -> Result<Vec<Chunk>> {
        self.index.search_text(search_term, case_sensitive).await
    }

    async fn corpus_stats(&self) -> Result<CorpusStats> {
        self.index.corpus_stats().await
    }
}

#[async_trait]
impl EmbeddingStore for SqliteStore {
    async fn store_embeddings(
        &self,
        chunk_ids: Vec<ChunkId>,
        embeddings: Vec<Vec<f16>>,
    ) -> Result<()> {
        if chunk_ids.len() != embeddings.len() {
            return Err(anyhow::anyhow!("Chunk IDs and embeddings count mismatch"));
        }

        for (chunk_id, embedding) in chunk_ids.into_iter().zip(embeddings.iter()) {
            self.index.update_chunk_embedding(chunk_id, embedding).await?;
        }

        Ok(())
    }

    async fn search_similar(
        &self,
        query: Vec<f16>,
        limit: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<(ChunkId, f32)>> {
        let chunks = self.index.get_all_chunks_with_embeddings().await?;
        Ok(rank_by_similarity(&query, chunks, limit, threshold)
            .into_iter()
            .filter_map(|(chunk, score)| chunk.id.map(|id| (id, score)))
            .collect())
    }

    async fn get_embedding(&self, chunk_id: ChunkId) -> Result<Option<Vec<f16>>> {
        let chunk = self.index.get_chunk_by_id(chunk_id).await?;
        Ok(chunk.and_then(|c| c.embedding))
    }

    async fn count_embedded_chunks(&self) -> Result<usize> {
        self.index.count_embedded_chunks().await
    }
}

#[async_trait]
impl CombinedStore for SqliteStore {
    async fn search_chunks(
        &self,
        query: Vec<f16>,
        limit: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<(Chunk, f32)>> {
        // One pass over the rows we already loaded, no per-hit lookups
        let chunks = self.index.get_all_chunks_with_embeddings().await?;
        Ok(rank_by_similarity(&query, chunks, limit, threshold))
    }
}

#[async_trait]
impl RunStore for SqliteStore {
    async fn insert_run(&self, run: &EvaluationRun) -> Result<Option<RunId>> {
        self.index.insert_run(run).await
    }

    async fn list_runs(&self, filter: &RunFilter, order: RunOrder) -> Result<Vec<EvaluationRun>> {
        self.index.select_runs(filter, order).await
    }

    async fn aggregate_runs(&self, filter: &RunFilter) -> Result<Vec<ModeAggregate>> {
        self.index.aggregate_runs(filter).await
    }

    async fn count_runs(&self) -> Result<usize> {
        self.index.count_runs().await
    }
}

/// Best `limit` chunks by cosine similarity to `query`, descending.
///
/// Equal scores keep storage order (chunk id).
fn rank_by_similarity(
    query: &[f16],
    chunks: Vec<Chunk>,
    limit: usize,
    threshold: Option<f32>,
) -> Vec<(Chunk, f32)> {
    let mut scored: Vec<(Chunk, f32)> = chunks
        .into_iter()
        .filter_map(|chunk| {
            let similarity = cosine_similarity(query, chunk.embedding.as_deref()?);
            match threshold {
                Some(min) if similarity < min => None,
                _ => Some((chunk, similarity)),
            }
        })
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.truncate(limit);
    scored
}

/// Cosine similarity of two f16 vectors, accumulated in f32.
///
/// Mismatched lengths and zero vectors score 0.
fn cosine_similarity(a: &[f16], b: &[f16]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let mut dot_product = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b) {
        let x = x.to_f32();
        let y = y.to_f32();
        dot_product += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let norm_a = norm_a.sqrt();
    let norm_b = norm_b.sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot_product / (norm_a * norm_b)
    }
}
