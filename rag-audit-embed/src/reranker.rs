//! Cross-encoder reranking providers
//!
//! A cross-encoder reads the query and a candidate text together and returns a
//! single relevance score for the pair. Scores are model logits: higher means
//! more relevant, and they are not comparable with bi-encoder similarities.

use crate::config::RerankConfig;
use crate::error::{EmbedError, Result};
use crate::provider::cache_key_for;
use async_trait::async_trait;
use fastembed::{RerankInitOptions, TextRerank};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

static RERANKER_CACHE: OnceLock<Mutex<HashMap<String, Arc<Mutex<TextRerank>>>>> = OnceLock::new();

fn get_reranker_cache() -> &'static Mutex<HashMap<String, Arc<Mutex<TextRerank>>>> {
    RERANKER_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Trait for providers that score (query, document) pairs
#[async_trait]
pub trait RerankProvider: Send + Sync {
    /// Score every document against the query.
    ///
    /// The returned vector is parallel to `documents`: element `i` is the
    /// score of `documents[i]`, whatever order the model produced them in.
    async fn score_pairs(&self, query: &str, documents: &[String]) -> Result<Vec<f32>>;

    /// Get the name/identifier of this provider
    fn provider_name(&self) -> &str;
}

/// FastEmbed-based cross-encoder provider
#[derive(Clone)]
pub struct FastEmbedReranker {
    config: RerankConfig,
    model: Option<Arc<Mutex<TextRerank>>>,
}

impl std::fmt::Debug for FastEmbedReranker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedReranker")
            .field("config", &self.config)
            .field("model", &self.model.is_some())
            .finish()
    }
}

impl FastEmbedReranker {
    pub fn new(config: RerankConfig) -> Self {
        Self {
            config,
            model: None,
        }
    }

    /// Downloads (if needed) and loads the cross-encoder.
    pub async fn initialize(&mut self) -> Result<()> {
        self.config.validate()?;
        tracing::info!(
            model = %self.config.model_name(),
            cache_dir = %self.config.cache_dir.display(),
            "Initializing FastEmbed reranker"
        );

        let cache_key = cache_key_for("rerank", &self.config)?;
        let cached = get_reranker_cache()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&cache_key)
            .map(Arc::clone);

        if let Some(model) = cached {
            tracing::info!("Using cached reranker for: {}", self.config.model_name());
            self.model = Some(model);
            return Ok(());
        }

        let config = self.config.clone();
        let model = tokio::task::spawn_blocking(move || -> Result<TextRerank> {
            tracing::info!("Loading reranker model: {}", config.model_name());
            let options = RerankInitOptions::new(config.resolve_model()?)
                .with_cache_dir(config.cache_dir.clone())
                .with_show_download_progress(config.show_download_progress);
            TextRerank::try_new(options).map_err(EmbedError::model_init)
        })
        .await??;

        let model = Arc::new(Mutex::new(model));
        get_reranker_cache()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cache_key, Arc::clone(&model));

        self.model = Some(model);
        tracing::info!("Reranker loaded: {}", self.config.model_name());
        Ok(())
    }

    /// Creates and initializes a reranker in one step.
    pub async fn create(config: RerankConfig) -> Result<Self> {
        let mut reranker = Self::new(config);
        reranker.initialize().await?;
        Ok(reranker)
    }

    pub fn config(&self) -> &RerankConfig {
        &self.config
    }

    /// Clears the global reranker cache.
    pub fn clear_cache() {
        get_reranker_cache()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::info!("Reranker cache cleared");
    }

    pub fn cache_size() -> usize {
        get_reranker_cache()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Put model output back into input order.
///
/// fastembed returns results sorted by score, each tagged with the index of
/// the document it belongs to.
fn scores_in_input_order(len: usize, ranked: &[(usize, f32)]) -> Result<Vec<f32>> {
    let mut scores: Vec<Option<f32>> = vec![None; len];
    for &(index, score) in ranked {
        let slot = scores.get_mut(index).ok_or_else(|| {
            EmbedError::reranking(format!("reranker returned out-of-range index {index}"))
        })?;
        *slot = Some(score);
    }

    scores
        .into_iter()
        .enumerate()
        .map(|(index, score)| {
            score.ok_or_else(|| {
                EmbedError::reranking(format!("reranker returned no score for document {index}"))
            })
        })
        .collect()
}

#[async_trait]
impl RerankProvider for FastEmbedReranker {
    async fn score_pairs(&self, query: &str, documents: &[String]) -> Result<Vec<f32>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }

        let model = self.model.as_ref().ok_or_else(|| {
            EmbedError::invalid_config("Reranker not initialized. Call initialize() first.")
        })?;

        tracing::debug!("Scoring {} (query, document) pairs", documents.len());

        let model = Arc::clone(model);
        let query = query.to_string();
        let docs = documents.to_vec();
        let batch_size = self.config.batch_size;

        let ranked = tokio::task::spawn_blocking(move || -> Result<Vec<(usize, f32)>> {
            let mut guard = model.lock().unwrap_or_else(PoisonError::into_inner);
            let results = guard
                .rerank(query, docs, false, Some(batch_size))
                .map_err(EmbedError::reranking)?;
            Ok(results.into_iter().map(|r| (r.index, r.score)).collect())
        })
        .await??;

        scores_in_input_order(documents.len(), &ranked)
    }

    fn provider_name(&self) -> &str {
        "fastembed-rerank"
    }
}
