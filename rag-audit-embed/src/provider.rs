//! Embedding provider implementations

use crate::config::EmbedConfig;
use crate::error::{EmbedError, Result};
use async_trait::async_trait;
use fastembed::{InitOptions, TextEmbedding};
use fnv::FnvHasher;
use half::f16;
use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

/// Result of embedding generation
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    /// The generated embeddings, one per input text
    pub embeddings: Vec<Vec<f16>>,
    /// The dimension of each embedding vector
    pub dimension: usize,
}

impl EmbeddingResult {
    /// Create a new embedding result. The dimension is inferred from the first
    /// vector and is 0 for an empty result.
    pub fn new(embeddings: Vec<Vec<f16>>) -> Self {
        let dimension = embeddings.first().map(|e| e.len()).unwrap_or(0);
        Self {
            embeddings,
            dimension,
        }
    }

    /// Number of embedding vectors (one per input text).
    pub fn len(&self) -> usize {
        self.embeddings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.embeddings.is_empty()
    }
}

/// Type alias for cached model entries (model, dimension)
type ModelCacheEntry = (Arc<Mutex<TextEmbedding>>, usize);

/// Global cache for initialized embedding models to avoid reloading
static MODEL_CACHE: OnceLock<Mutex<HashMap<String, ModelCacheEntry>>> = OnceLock::new();

fn get_model_cache() -> &'static Mutex<HashMap<String, ModelCacheEntry>> {
    MODEL_CACHE.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Hash a serializable model configuration into a versioned cache key.
pub(crate) fn cache_key_for<T: serde::Serialize>(kind: &str, config: &T) -> Result<String> {
    let config_json =
        serde_json::to_string(config).map_err(|e| EmbedError::External { source: e.into() })?;

    let mut hasher = FnvHasher::default();
    hasher.write(b"v2:");
    hasher.write(kind.as_bytes());
    hasher.write(config_json.as_bytes());

    Ok(format!("v2:{kind}:{:x}", hasher.finish()))
}

/// Trait for embedding providers that can generate embeddings from text
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate embeddings for a single text
    async fn embed_text(&self, text: &str) -> Result<Vec<f16>>;

    /// Generate embeddings for multiple texts (batch processing)
    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult>;

    /// Get the dimension of embeddings produced by this provider
    fn embedding_dimension(&self) -> usize;

    /// Get the name/identifier of this provider
    fn provider_name(&self) -> &str;
}

/// FastEmbed-based embedding provider using local ONNX models
#[derive(Clone)]
pub struct FastEmbedProvider {
    config: EmbedConfig,
    model: Option<Arc<Mutex<TextEmbedding>>>,
    dimension: usize,
}

impl std::fmt::Debug for FastEmbedProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FastEmbedProvider")
            .field("config", &self.config)
            .field("model", &self.model.is_some())
            .field("dimension", &self.dimension)
            .finish()
    }
}

impl FastEmbedProvider {
    /// Creates a new uninitialized provider. Call [`initialize`](Self::initialize)
    /// or use [`create`](Self::create) before embedding.
    pub fn new(config: EmbedConfig) -> Self {
        Self {
            config,
            model: None,
            dimension: 384, // all-MiniLM-L6-v2
        }
    }

    /// Downloads (if needed) and loads the embedding model, reusing a cached
    /// instance when one exists for the same configuration.
    pub async fn initialize(&mut self) -> Result<()> {
        self.config.validate()?;
        tracing::info!(
            model = %self.config.model_name(),
            cache_dir = %self.config.cache_dir.display(),
            "Initializing FastEmbed embedding provider"
        );

        let cache_key = self.create_cache_key()?;

        let cached_data = {
            let cache = get_model_cache()
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            cache
                .get(&cache_key)
                .map(|(model, dim)| (Arc::clone(model), *dim))
        };

        if let Some((cached_model, cached_dimension)) = cached_data {
            tracing::info!("Using cached model for: {}", self.config.model_name());
            self.model = Some(cached_model);
            self.dimension = cached_dimension;
            return self.validate_model().await;
        }

        let config = self.config.clone();
        let (model, dimension) =
            tokio::task::spawn_blocking(move || -> Result<(TextEmbedding, usize)> {
                tracing::info!("Loading embedding model: {}", config.model_name());

                let init_options = InitOptions::new(config.resolve_model()?)
                    .with_cache_dir(config.cache_dir.clone())
                    .with_show_download_progress(config.show_download_progress);

                let mut model = TextEmbedding::try_new(init_options).map_err(EmbedError::model_init)?;

                // Probe the dimension with a throwaway embedding
                let sample = model
                    .embed(vec!["dimension check".to_string()], None)
                    .map_err(EmbedError::model_init)?;
                let dimension = sample.first().map(|emb| emb.len()).unwrap_or(0);

                tracing::info!("Model loaded successfully. Dimension: {}", dimension);
                Ok((model, dimension))
            })
            .await??;

        let model_arc = Arc::new(Mutex::new(model));
        {
            let mut cache = get_model_cache()
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            cache.insert(cache_key, (Arc::clone(&model_arc), dimension));
        }

        self.model = Some(model_arc);
        self.dimension = dimension;

        self.validate_model().await
    }

    /// Creates and initializes a provider in one step.
    pub async fn create(config: EmbedConfig) -> Result<Self> {
        let mut provider = Self::new(config);
        provider.initialize().await?;
        Ok(provider)
    }

    pub fn config(&self) -> &EmbedConfig {
        &self.config
    }

    fn create_cache_key(&self) -> Result<String> {
        cache_key_for("embed", &self.config)
    }

    /// Validate that the model produces finite vectors of the expected width
    async fn validate_model(&self) -> Result<()> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| EmbedError::invalid_config("Model not initialized"))?;

        let model_clone = Arc::clone(model);
        let validation_result = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
            let mut model_guard = model_clone.lock().unwrap_or_else(PoisonError::into_inner);
            model_guard
                .embed(vec!["validation test".to_string()], None)
                .map_err(|e| EmbedError::External { source: e })
        })
        .await??;

        let embedding = validation_result.first().ok_or_else(|| {
            EmbedError::invalid_config("Model validation failed: no embeddings generated")
        })?;

        if embedding.is_empty() {
            return Err(EmbedError::invalid_config(
                "Model validation failed: empty embedding",
            ));
        }

        if embedding.len() != self.dimension {
            return Err(EmbedError::invalid_config(format!(
                "Model validation failed: expected dimension {}, got {}",
                self.dimension,
                embedding.len()
            )));
        }

        if embedding.iter().any(|value| !value.is_finite()) {
            return Err(EmbedError::invalid_config(
                "Model validation failed: non-finite values in embedding",
            ));
        }

        tracing::debug!("Model validation passed for: {}", self.config.model_name());
        Ok(())
    }

    /// Clears the global embedding model cache.
    pub fn clear_cache() {
        get_model_cache()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::info!("Embedding model cache cleared");
    }

    /// Returns the number of cached embedding models.
    pub fn cache_size() -> usize {
        get_model_cache()
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Convert f32 embeddings to f16, normalizing when configured
    fn convert_to_f16(&self, embeddings: Vec<Vec<f32>>) -> Vec<Vec<f16>> {
        embeddings
            .into_iter()
            .map(|embedding| to_f16(embedding, self.config.normalize))
            .collect()
    }
}

fn to_f16(embedding: Vec<f32>, normalize: bool) -> Vec<f16> {
    let norm = if normalize {
        embedding.iter().map(|x| x * x).sum::<f32>().sqrt()
    } else {
        0.0
    };

    embedding
        .into_iter()
        .map(|value| {
            if norm > 0.0 {
                f16::from_f32(value / norm)
            } else {
                f16::from_f32(value)
            }
        })
        .collect()
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed_text(&self, text: &str) -> Result<Vec<f16>> {
        let texts = vec![text.to_string()];
        let result = self.embed_texts(&texts).await?;
        result
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| EmbedError::embedding_gen("No embedding generated for text"))
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<EmbeddingResult> {
        if texts.is_empty() {
            return Ok(EmbeddingResult::new(vec![]));
        }

        let model = self.model.as_ref().ok_or_else(|| {
            EmbedError::invalid_config("Model not initialized. Call initialize() first.")
        })?;

        tracing::debug!("Generating embeddings for {} texts", texts.len());

        let mut all_embeddings = Vec::with_capacity(texts.len());

        for chunk in texts.chunks(self.config.batch_size.max(1)) {
            let chunk = chunk.to_vec();
            let model_clone = Arc::clone(model);

            let batch_embeddings = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
                tracing::debug!("Processing batch of {} texts", chunk.len());

                let mut model_guard = model_clone.lock().unwrap_or_else(PoisonError::into_inner);
                model_guard
                    .embed(chunk, None)
                    .map_err(EmbedError::embedding_gen)
            })
            .await??;

            all_embeddings.extend(self.convert_to_f16(batch_embeddings));
        }

        tracing::debug!("Generated {} embeddings", all_embeddings.len());
        Ok(EmbeddingResult::new(all_embeddings))
    }

    fn embedding_dimension(&self) -> usize {
        self.dimension
    }

    fn provider_name(&self) -> &str {
        "fastembed"
    }
}
