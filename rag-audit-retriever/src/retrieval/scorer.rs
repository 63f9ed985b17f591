//! Precision stage: cross-encoder relevance of (query, chunk text) pairs.

use crate::error::{RetrieveError, Stage};
use async_trait::async_trait;
use rag_audit_embed::RerankProvider;
use std::sync::Arc;

/// Scores how well a chunk answers a query. Higher is more relevant.
#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    async fn score(&self, query: &str, text: &str) -> Result<f32, RetrieveError>;

    /// Score many texts against one query; element `i` belongs to `texts[i]`.
    ///
    /// The default scores pairs one at a time. Implementations backed by a
    /// batched model should override it.
    async fn score_all(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, RetrieveError> {
        let mut scores = Vec::with_capacity(texts.len());
        for text in texts {
            scores.push(self.score(query, text).await?);
        }
        Ok(scores)
    }
}

/// [`RelevanceScorer`] backed by a cross-encoder model.
pub struct CrossEncoderScorer {
    provider: Arc<dyn RerankProvider>,
}

impl CrossEncoderScorer {
    pub fn new(provider: Arc<dyn RerankProvider>) -> Self {
        Self { provider }
    }
}

#[async_trait]
impl RelevanceScorer for CrossEncoderScorer {
    async fn score(&self, query: &str, text: &str) -> Result<f32, RetrieveError> {
        let scores = self.score_all(query, &[text.to_string()]).await?;
        scores
            .first()
            .copied()
            .ok_or_else(|| RetrieveError::upstream(Stage::Rerank, "cross-encoder returned no score"))
    }

    async fn score_all(&self, query: &str, texts: &[String]) -> Result<Vec<f32>, RetrieveError> {
        let scores = self
            .provider
            .score_pairs(query, texts)
            .await
            .map_err(|e| RetrieveError::upstream(Stage::Rerank, e))?;

        if scores.len() != texts.len() {
            return Err(RetrieveError::upstream(
                Stage::Rerank,
                format!(
                    "{} returned {} scores for {} texts",
                    self.provider.provider_name(),
                    scores.len(),
                    texts.len()
                ),
            ));
        }
        if let Some(bad) = scores.iter().position(|score| !score.is_finite()) {
            return Err(RetrieveError::upstream(
                Stage::Rerank,
                format!(
                    "{} returned score {} for text {}",
                    self.provider.provider_name(),
                    scores[bad],
                    bad + 1
                ),
            ));
        }
        Ok(scores)
    }
}
