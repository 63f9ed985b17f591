//! Recall then rerank, behind one call parameterized by [`RetrievalMode`].

use super::{EmbeddingIndex, RelevanceScorer, RetrievalMode, RetrievalResult, ScoredChunk};
use crate::config::RetrievalConfig;
use crate::error::{RetrieveError, Stage};
use std::cmp::Ordering;
use std::sync::Arc;

/// Two-stage retriever.
///
/// ```text
/// vector_only:  index.search(q, k_final)                    -> top k_final
/// reranked:     index.search(q, k_raw) -> scorer -> sort    -> top k_final
/// ```
///
/// The query is embedded once per call. An empty corpus gives an empty
/// result. Model failures surface as [`RetrieveError::UpstreamUnavailable`]
/// and are not retried.
pub struct Retriever {
    config: RetrievalConfig,
    index: Arc<dyn EmbeddingIndex>,
    scorer: Option<Arc<dyn RelevanceScorer>>,
}

impl Retriever {
    pub fn new(config: RetrievalConfig, index: Arc<dyn EmbeddingIndex>) -> Self {
        Self {
            config,
            index,
            scorer: None,
        }
    }

    /// Attach the cross-encoder used by [`RetrievalMode::Reranked`].
    pub fn with_scorer(self, scorer: Arc<dyn RelevanceScorer>) -> Self {
        Self {
            scorer: Some(scorer),
            ..self
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieve with the configured `k_raw` and `k_final`.
    pub async fn retrieve(
        &self,
        query: &str,
        mode: RetrievalMode,
    ) -> Result<RetrievalResult, RetrieveError> {
        self.retrieve_with(query, mode, self.config.k_raw, self.config.k_final)
            .await
    }

    /// Retrieve with explicit sizes.
    ///
    /// `k_raw` below `k_final` is raised to `k_final`; `k_final` of zero
    /// returns an empty result.
    pub async fn retrieve_with(
        &self,
        query: &str,
        mode: RetrievalMode,
        k_raw: usize,
        k_final: usize,
    ) -> Result<RetrievalResult, RetrieveError> {
        if k_final == 0 {
            return Ok(RetrievalResult::empty(mode));
        }

        let (mut hits, stage) = match mode {
            RetrievalMode::VectorOnly => (self.index.search(query, k_final).await?, Stage::Recall),
            RetrievalMode::Reranked => (self.rerank(query, k_raw.max(k_final)).await?, Stage::Rerank),
        };
        ensure_finite(&hits, stage)?;

        sort_descending(&mut hits);
        hits.truncate(k_final);

        tracing::info!(
            mode = %mode,
            k_raw,
            k_final,
            returned = hits.len(),
            "Retrieval complete"
        );
        Ok(RetrievalResult { mode, hits })
    }

    async fn rerank(&self, query: &str, k_raw: usize) -> Result<Vec<ScoredChunk>, RetrieveError> {
        let candidates = self.index.search(query, k_raw).await?;
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let scorer = self.scorer.as_ref().ok_or_else(|| {
            RetrieveError::upstream(Stage::Rerank, "no cross-encoder configured")
        })?;

        let texts: Vec<String> = candidates.iter().map(|c| c.chunk.content.clone()).collect();
        let scores = scorer.score_all(query, &texts).await?;
        if scores.len() != candidates.len() {
            return Err(RetrieveError::upstream(
                Stage::Rerank,
                format!("{} scores for {} candidates", scores.len(), candidates.len()),
            ));
        }

        tracing::debug!(candidates = candidates.len(), "Reranked recall candidates");

        Ok(candidates
            .into_iter()
            .zip(scores)
            .map(|(candidate, score)| ScoredChunk {
                chunk: candidate.chunk,
                score,
            })
            .collect())
    }
}

/// NaN and infinite scores can be neither ranked nor recorded.
fn ensure_finite(hits: &[ScoredChunk], stage: Stage) -> Result<(), RetrieveError> {
    match hits.iter().find(|hit| !hit.score.is_finite()) {
        Some(hit) => Err(RetrieveError::upstream(
            stage,
            format!("non-finite score {} for chunk {:?}", hit.score, hit.chunk.id),
        )),
        None => Ok(()),
    }
}

/// Stable descending sort over finite scores.
fn sort_descending(hits: &mut [ScoredChunk]) {
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
}
