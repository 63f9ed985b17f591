//! Two-stage retrieval: embedding recall, then optional cross-encoder rerank.
//!
//! - [`EmbeddingIndex`] finds the nearest chunks for a query ([`VectorIndex`]
//!   is the SQLite-backed implementation)
//! - [`RelevanceScorer`] scores (query, chunk text) pairs ([`CrossEncoderScorer`])
//! - [`Retriever`] combines the two under a [`RetrievalMode`]
//! - [`ingest`] loads pre-chunked documents into the corpus store

pub mod ingest;
pub mod retriever;
pub mod scorer;
pub mod vector_index;

use crate::storage::Chunk;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use retriever::Retriever;
pub use scorer::{CrossEncoderScorer, RelevanceScorer};
pub use vector_index::{EmbeddingIndex, VectorIndex};

/// How a query was answered; also the tag stored on every evaluation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    /// Top `k_final` chunks by embedding similarity
    VectorOnly,
    /// Top `k_raw` by similarity, rescored by the cross-encoder, cut to `k_final`
    Reranked,
}

impl RetrievalMode {
    pub const ALL: [RetrievalMode; 2] = [RetrievalMode::VectorOnly, RetrievalMode::Reranked];

    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::VectorOnly => "vector_only",
            RetrievalMode::Reranked => "reranked",
        }
    }
}

impl fmt::Display for RetrievalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown retrieval mode '{0}' (expected vector_only or reranked)")]
pub struct ParseModeError(pub String);

impl FromStr for RetrievalMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "vector_only" | "vector" => Ok(RetrievalMode::VectorOnly),
            "reranked" | "rerank" => Ok(RetrievalMode::Reranked),
            _ => Err(ParseModeError(s.to_string())),
        }
    }
}

/// A chunk with the score of the stage that ranked it.
///
/// Recall scores are cosine similarities; rerank scores are cross-encoder
/// logits. The two are not comparable.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub chunk: Chunk,
    pub score: f32,
}

/// Ordered answer of one retrieval mode for one query.
///
/// Hits are sorted by descending score and never exceed the requested size.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalResult {
    pub mode: RetrievalMode,
    pub hits: Vec<ScoredChunk>,
}

impl RetrievalResult {
    pub fn empty(mode: RetrievalMode) -> Self {
        Self {
            mode,
            hits: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScoredChunk> {
        self.hits.iter()
    }

    pub fn scores(&self) -> Vec<f32> {
        self.hits.iter().map(|hit| hit.score).collect()
    }
}
