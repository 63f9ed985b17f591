//! Configuration for embedding and reranking models

use crate::error::{EmbedError, Result};
use fastembed::{EmbeddingModel, RerankerModel};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default bi-encoder used for the recall stage.
pub const DEFAULT_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2";

/// Default cross-encoder used for the precision stage.
pub const DEFAULT_RERANKER_MODEL: &str = "bge-reranker-base";

/// Built-in embedding models, by the short name used in configuration files.
const EMBEDDING_MODELS: &[(&str, EmbeddingModel)] = &[
    ("all-MiniLM-L6-v2", EmbeddingModel::AllMiniLML6V2),
    ("all-MiniLM-L12-v2", EmbeddingModel::AllMiniLML12V2),
    ("bge-small-en-v1.5", EmbeddingModel::BGESmallENV15),
    ("bge-base-en-v1.5", EmbeddingModel::BGEBaseENV15),
    (
        "paraphrase-multilingual-MiniLM-L12-v2",
        EmbeddingModel::ParaphraseMLMiniLML12V2,
    ),
    ("multilingual-e5-small", EmbeddingModel::MultilingualE5Small),
];

/// Built-in cross-encoder models, by short name.
const RERANKER_MODELS: &[(&str, RerankerModel)] = &[
    ("bge-reranker-base", RerankerModel::BGERerankerBase),
    ("bge-reranker-v2-m3", RerankerModel::BGERerankerV2M3),
    ("jina-reranker-v1-turbo-en", RerankerModel::JINARerankerV1TurboEn),
    (
        "jina-reranker-v2-base-multilingual",
        RerankerModel::JINARerankerV2BaseMultiligual,
    ),
];

/// Configuration for the bi-encoder embedding model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedConfig {
    /// Short name of a built-in fastembed model (see [`EmbedConfig::supported_models`])
    pub model_name: String,
    /// Directory where ONNX weights are downloaded and cached
    pub cache_dir: PathBuf,
    /// Maximum number of texts sent to the model in one call
    pub batch_size: usize,
    /// Whether to L2-normalize embeddings after generation
    pub normalize: bool,
    /// Print download progress when fetching weights
    pub show_download_progress: bool,
}

impl EmbedConfig {
    /// Create a configuration for the named model with default settings.
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            ..Self::default()
        }
    }

    /// Set the model cache directory (builder style)
    pub fn with_cache_dir<P: AsRef<Path>>(self, cache_dir: P) -> Self {
        Self {
            cache_dir: cache_dir.as_ref().to_path_buf(),
            ..self
        }
    }

    /// Set the batch size for embedding generation (builder style)
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    /// Set whether to normalize embeddings (builder style)
    pub fn with_normalize(self, normalize: bool) -> Self {
        Self { normalize, ..self }
    }

    /// Set whether download progress is printed (builder style)
    pub fn with_download_progress(self, show_download_progress: bool) -> Self {
        Self {
            show_download_progress,
            ..self
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    /// Names accepted in `model_name`.
    pub fn supported_models() -> impl Iterator<Item = &'static str> {
        EMBEDDING_MODELS.iter().map(|(name, _)| *name)
    }

    /// Map the configured name onto a fastembed model.
    pub fn resolve_model(&self) -> Result<EmbeddingModel> {
        EMBEDDING_MODELS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&self.model_name))
            .map(|(_, model)| model.clone())
            .ok_or_else(|| {
                EmbedError::invalid_config(format!(
                    "unknown embedding model '{}' (supported: {})",
                    self.model_name,
                    Self::supported_models().collect::<Vec<_>>().join(", ")
                ))
            })
    }

    /// Check the configuration before any model is loaded.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be at least 1"));
        }
        self.resolve_model()?;
        tracing::debug!("Embedding config valid for: {}", self.model_name);
        Ok(())
    }
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_EMBEDDING_MODEL.to_string(),
            cache_dir: PathBuf::from("models"),
            batch_size: 16,
            normalize: true,
            show_download_progress: false,
        }
    }
}

/// Configuration for the cross-encoder reranking model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RerankConfig {
    /// Short name of a built-in fastembed reranker (see [`RerankConfig::supported_models`])
    pub model_name: String,
    /// Directory where ONNX weights are downloaded and cached
    pub cache_dir: PathBuf,
    /// Maximum number of (query, document) pairs scored in one call
    pub batch_size: usize,
    /// Print download progress when fetching weights
    pub show_download_progress: bool,
}

impl RerankConfig {
    pub fn new(model_name: impl Into<String>) -> Self {
        Self {
            model_name: model_name.into(),
            ..Self::default()
        }
    }

    pub fn with_cache_dir<P: AsRef<Path>>(self, cache_dir: P) -> Self {
        Self {
            cache_dir: cache_dir.as_ref().to_path_buf(),
            ..self
        }
    }

    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }

    pub fn with_download_progress(self, show_download_progress: bool) -> Self {
        Self {
            show_download_progress,
            ..self
        }
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn supported_models() -> impl Iterator<Item = &'static str> {
        RERANKER_MODELS.iter().map(|(name, _)| *name)
    }

    /// Map the configured name onto a fastembed reranker.
    pub fn resolve_model(&self) -> Result<RerankerModel> {
        RERANKER_MODELS
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(&self.model_name))
            .map(|(_, model)| model.clone())
            .ok_or_else(|| {
                EmbedError::invalid_config(format!(
                    "unknown reranker model '{}' (supported: {})",
                    self.model_name,
                    Self::supported_models().collect::<Vec<_>>().join(", ")
                ))
            })
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(EmbedError::invalid_config("batch_size must be at least 1"));
        }
        self.resolve_model()?;
        tracing::debug!("Reranker config valid for: {}", self.model_name);
        Ok(())
    }
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            model_name: DEFAULT_RERANKER_MODEL.to_string(),
            cache_dir: PathBuf::from("models"),
            batch_size: 32,
            show_download_progress: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_config_defaults() {
        let config = EmbedConfig::default();

        assert_eq!(config.model_name(), "all-MiniLM-L6-v2");
        assert_eq!(config.cache_dir, PathBuf::from("models"));
        assert_eq!(config.batch_size, 16);
        assert!(config.normalize);
        assert!(config.validate().is_ok());

        let rerank = RerankConfig::default();
        assert_eq!(rerank.model_name(), "bge-reranker-base");
        assert!(rerank.validate().is_ok());
    }

    #[test]
    fn test_config_builder_methods() {
        let temp_dir = tempdir().unwrap();
        let config = EmbedConfig::new("bge-small-en-v1.5")
            .with_cache_dir(temp_dir.path())
            .with_batch_size(64)
            .with_normalize(false)
            .with_download_progress(true);

        assert_eq!(config.model_name(), "bge-small-en-v1.5");
        assert_eq!(config.cache_dir, temp_dir.path());
        assert_eq!(config.batch_size, 64);
        assert!(!config.normalize);
        assert!(config.show_download_progress);
    }

    #[test]
    fn test_model_names_resolve_case_insensitively() {
        assert!(matches!(
            EmbedConfig::new("ALL-minilm-l6-v2").resolve_model(),
            Ok(EmbeddingModel::AllMiniLML6V2)
        ));
        assert!(matches!(
            RerankConfig::new("jina-reranker-v1-turbo-en").resolve_model(),
            Ok(RerankerModel::JINARerankerV1TurboEn)
        ));
    }

    #[test]
    fn test_unknown_model_is_invalid_config() {
        let err = EmbedConfig::new("word2vec").validate().unwrap_err();
        assert!(matches!(err, EmbedError::InvalidConfig { .. }));
        assert!(err.to_string().contains("word2vec"));
        assert!(err.to_string().contains("all-MiniLM-L6-v2"));

        let err = RerankConfig::new("ms-marco-MiniLM-L6-v2")
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("bge-reranker-base"));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        assert!(EmbedConfig::default().with_batch_size(0).validate().is_err());
        assert!(RerankConfig::default().with_batch_size(0).validate().is_err());
    }

    #[test]
    fn test_config_serializes_for_cache_keys() {
        let config = RerankConfig::new("bge-reranker-v2-m3").with_cache_dir("/tmp/models");
        let json = serde_json::to_string(&config).unwrap();
        let back: RerankConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }
}
