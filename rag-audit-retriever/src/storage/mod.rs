//! Storage abstraction layer for the audit toolkit
//!
//! Trait-based access to the corpus (chunks and their embeddings) and to the
//! append-only log of evaluation runs. Retrieval and evaluation code only see
//! these traits; [`SqliteStore`] is the concrete backend.
//!
//! ## Key Components
//!
//! - **ChunkStore**: Text storage and retrieval operations
//! - **EmbeddingStore**: Vector similarity search operations
//! - **CombinedStore**: Unified interface combining both stores
//! - **RunStore**: Evaluation runs, append-only, deduplicated by timestamp
//!
//! ## Architecture
//!
//! ```text
//! ChunkStore ─┐
//!             ├─ CombinedStore ─┐
//! EmbeddingStore ─┘             ├── SqliteStore ── AuditIndex (SQL)
//! RunStore ─────────────────────┘
//! ```

use crate::evaluation::{EvaluationRun, RunFilter, RunId, RunOrder};
use crate::retrieval::RetrievalMode;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

pub mod audit_index;
pub mod sqlite_store;

pub use audit_index::AuditIndex;
pub use sqlite_store::SqliteStore;

/// Blake3 hash of a chunk's source, page and text (32 bytes).
pub type ContentHash = [u8; 32];

/// Database ID for a text chunk.
pub type ChunkId = i64;

/// Text chunk from a source document.
///
/// Chunks are immutable once ingested; only a missing embedding may be filled
/// in later.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub id: Option<ChunkId>,
    pub content_hash: ContentHash,
    /// Source document, usually a file name
    pub source: String,
    pub page: Option<u32>,
    /// Ordinal of the chunk within its source document
    pub position: usize,
    pub content: String,
    pub embedding: Option<Vec<half::f16>>,
}

impl Chunk {
    /// New, not yet stored chunk. The content hash is derived from the
    /// source, page and text.
    pub fn new(
        source: impl Into<String>,
        page: Option<u32>,
        position: usize,
        content: impl Into<String>,
    ) -> Self {
        let source = source.into();
        let content = content.into();
        Self {
            id: None,
            content_hash: content_hash(&source, page, &content),
            source,
            page,
            position,
            content,
            embedding: None,
        }
    }

    pub fn with_embedding(self, embedding: Vec<half::f16>) -> Self {
        Self {
            embedding: Some(embedding),
            ..self
        }
    }

    /// `source` or `source p.N` for display.
    pub fn location(&self) -> String {
        match self.page {
            Some(page) => format!("{} p.{}", self.source, page),
            None => self.source.clone(),
        }
    }
}

/// Identity of a chunk for idempotent ingestion.
pub fn content_hash(source: &str, page: Option<u32>, content: &str) -> ContentHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(source.as_bytes());
    hasher.update(&[0]);
    hasher.update(&page.map_or(-1i64, i64::from).to_le_bytes());
    hasher.update(content.as_bytes());
    *hasher.finalize().as_bytes()
}

/// Query filter for chunk listings.
#[derive(Debug, Clone, Default)]
pub struct ChunkFilter {
    pub source: Option<String>,
    pub has_embedding: Option<bool>,
    pub limit: Option<usize>,
}

/// Chunk metadata without content or embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkMetadata {
    pub id: ChunkId,
    pub source: String,
    pub page: Option<u32>,
    pub position: usize,
    pub content_length: usize,
    pub has_embedding: bool,
}

/// Corpus-wide counts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CorpusStats {
    pub chunk_count: usize,
    pub embedded_chunk_count: usize,
    pub source_count: usize,
}

/// Per-mode sums over a filtered set of runs. Modes without runs are absent.
#[derive(Debug, Clone, PartialEq)]
pub struct ModeAggregate {
    pub mode: RetrievalMode,
    pub run_count: usize,
    pub mean_hit_rate: f64,
    pub mean_mrr: f64,
    pub mean_precision_at_k: f64,
}

/// Text storage operations for corpus chunks.
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// Insert chunks, returning their IDs in input order.
    ///
    /// A chunk whose content hash is already stored keeps its row and ID; a
    /// provided embedding only fills in a missing one.
    async fn insert_chunks(&self, chunks: Vec<Chunk>) -> Result<Vec<ChunkId>>;

    /// Get a specific chunk by ID
    async fn get_chunk(&self, id: ChunkId) -> Result<Option<Chunk>>;

    /// List chunks matching filter criteria, ordered by source and position
    async fn list_chunks(&self, filter: ChunkFilter) -> Result<Vec<ChunkMetadata>>;

    /// Every chunk with its text, ordered by source and position
    async fn get_all_chunks(&self) -> Result<Vec<Chunk>>;

    /// Search for chunks containing the specified text
    async fn search_text(&self, search_term: &str, case_sensitive: bool) -> Result<Vec<Chunk>>;

    async fn corpus_stats(&self) -> Result<CorpusStats>;
}

/// Vector similarity search operations.
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    /// Store embeddings for chunks
    async fn store_embeddings(
        &self,
        chunk_ids: Vec<ChunkId>,
        embeddings: Vec<Vec<half::f16>>,
    ) -> Result<()>;

    /// Search for similar chunks using cosine similarity, best first
    async fn search_similar(
        &self,
        query: Vec<half::f16>,
        limit: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<(ChunkId, f32)>>;

    /// Get embedding for a specific chunk
    async fn get_embedding(&self, chunk_id: ChunkId) -> Result<Option<Vec<half::f16>>>;

    async fn count_embedded_chunks(&self) -> Result<usize>;
}

/// Unified store combining text and vector operations.
#[async_trait]
pub trait CombinedStore: ChunkStore + EmbeddingStore + Send + Sync {
    /// Search for similar chunks and return full chunk data
    async fn search_chunks(
        &self,
        query: Vec<half::f16>,
        limit: usize,
        threshold: Option<f32>,
    ) -> Result<Vec<(Chunk, f32)>>;
}

/// Append-only store of evaluation runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a run and its chunk snapshots in one transaction.
    ///
    /// Returns `None` without writing anything when a run with the same
    /// timestamp already exists. The check and the insert are atomic.
    async fn insert_run(&self, run: &EvaluationRun) -> Result<Option<RunId>>;

    /// Runs matching the filter, with their chunk snapshots.
    async fn list_runs(&self, filter: &RunFilter, order: RunOrder) -> Result<Vec<EvaluationRun>>;

    /// Mean metrics and counts per mode for the runs matching the filter.
    async fn aggregate_runs(&self, filter: &RunFilter) -> Result<Vec<ModeAggregate>>;

    async fn count_runs(&self) -> Result<usize>;
}
