//! Configuration for the audit toolkit.
//!
//! Resolution order (highest priority first):
//! 1. CLI flags (applied via [`AuditConfig::apply_overrides`])
//! 2. Config file (`--config <path>`, else `rag-audit.toml` in the base dir)
//! 3. Compiled defaults
//!
//! ```toml
//! [retrieval]
//! k_raw = 20
//! k_final = 3
//!
//! [models]
//! embedding_model = "all-MiniLM-L6-v2"
//! reranker_model = "bge-reranker-base"
//! cache_dir = "models"
//! show_download_progress = false
//! ```

use rag_audit_embed::{
    DEFAULT_EMBEDDING_MODEL, DEFAULT_RERANKER_MODEL, EmbedConfig, RerankConfig,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the project config file looked up in the base directory.
pub const CONFIG_FILE_NAME: &str = "rag-audit.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {field} {message}")]
    Invalid { field: String, message: String },

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: String, message: String },
}

/// Candidate and shortlist sizes for one retrieval.
///
/// Passed explicitly into [`Retriever::new`](crate::retrieval::Retriever::new).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Candidates pulled from the embedding index before reranking
    pub k_raw: usize,
    /// Chunks returned to the caller
    pub k_final: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k_raw: 20,
            k_final: 3,
        }
    }
}

impl RetrievalConfig {
    pub fn new(k_raw: usize, k_final: usize) -> Result<Self, ConfigError> {
        let config = Self { k_raw, k_final };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.k_final == 0 {
            return Err(ConfigError::Invalid {
                field: "retrieval.k_final".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.k_raw < self.k_final {
            return Err(ConfigError::Invalid {
                field: "retrieval.k_raw".to_string(),
                message: format!("must be at least k_final ({})", self.k_final),
            });
        }
        Ok(())
    }
}

/// Which local models to load and where their weights live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub embedding_model: String,
    pub reranker_model: String,
    /// Relative paths are resolved against the base directory
    pub cache_dir: PathBuf,
    pub show_download_progress: bool,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            reranker_model: DEFAULT_RERANKER_MODEL.to_string(),
            cache_dir: PathBuf::from("models"),
            show_download_progress: false,
        }
    }
}

impl ModelSettings {
    fn resolved_cache_dir(&self, base_dir: &Path) -> PathBuf {
        if self.cache_dir.is_absolute() {
            self.cache_dir.clone()
        } else {
            base_dir.join(&self.cache_dir)
        }
    }

    pub fn embed_config(&self, base_dir: &Path) -> EmbedConfig {
        EmbedConfig::new(&self.embedding_model)
            .with_cache_dir(self.resolved_cache_dir(base_dir))
            .with_download_progress(self.show_download_progress)
    }

    pub fn rerank_config(&self, base_dir: &Path) -> RerankConfig {
        RerankConfig::new(&self.reranker_model)
            .with_cache_dir(self.resolved_cache_dir(base_dir))
            .with_download_progress(self.show_download_progress)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuditConfig {
    pub retrieval: RetrievalConfig,
    pub models: ModelSettings,
}

/// Values given on the command line that win over the config file.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub k_raw: Option<usize>,
    pub k_final: Option<usize>,
}

impl AuditConfig {
    /// Load configuration for a base directory.
    ///
    /// An explicit path must exist; the default `rag-audit.toml` is optional.
    pub fn load(
        base_dir: &Path,
        explicit: Option<&Path>,
        overrides: &ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut config = match explicit {
            Some(path) => Self::from_file(path)?,
            None => {
                let path = base_dir.join(CONFIG_FILE_NAME);
                if path.exists() {
                    Self::from_file(&path)?
                } else {
                    tracing::debug!("No {} in {}, using defaults", CONFIG_FILE_NAME, base_dir.display());
                    Self::default()
                }
            }
        };

        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        tracing::info!("Loaded configuration from {}", path.display());
        Self::parse(&text, &path.display().to_string())
    }

    /// Load configuration from a TOML string (for testing).
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        Self::parse(toml_str, "<string>")
    }

    fn parse(toml_str: &str, origin: &str) -> Result<Self, ConfigError> {
        toml::from_str(toml_str).map_err(|e| ConfigError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }

    pub fn apply_overrides(&mut self, overrides: &ConfigOverrides) {
        if let Some(k_raw) = overrides.k_raw {
            self.retrieval.k_raw = k_raw;
        }
        if let Some(k_final) = overrides.k_final {
            self.retrieval.k_final = k_final;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retrieval.validate()?;
        for (field, value) in [
            ("models.embedding_model", &self.models.embedding_model),
            ("models.reranker_model", &self.models.reranker_model),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    field: field.to_string(),
                    message: "must not be empty".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = AuditConfig::default();
        assert_eq!(config.retrieval, RetrievalConfig { k_raw: 20, k_final: 3 });
        assert_eq!(config.models.embedding_model, "all-MiniLM-L6-v2");
        assert_eq!(config.models.reranker_model, "bge-reranker-base");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = AuditConfig::from_toml("[retrieval]\nk_final = 5\n").unwrap();
        assert_eq!(config.retrieval.k_raw, 20);
        assert_eq!(config.retrieval.k_final, 5);
        assert_eq!(config.models, ModelSettings::default());
    }

    #[test]
    fn test_invalid_sizes_rejected() {
        assert!(RetrievalConfig::new(20, 0).is_err());
        assert!(RetrievalConfig::new(2, 3).is_err());
        assert!(RetrievalConfig::new(3, 3).is_ok());

        let config = AuditConfig::from_toml("[retrieval]\nk_raw = 1\nk_final = 4\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("retrieval.k_raw"));
    }

    #[test]
    fn test_parse_error_names_origin() {
        let err = AuditConfig::from_toml("[retrieval\nk_raw = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("<string>"));
    }

    #[test]
    fn test_load_from_base_dir_with_overrides() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            "[retrieval]\nk_raw = 10\n\n[models]\ncache_dir = \"weights\"\n",
        )
        .unwrap();

        let overrides = ConfigOverrides {
            k_raw: None,
            k_final: Some(2),
        };
        let config = AuditConfig::load(dir.path(), None, &overrides).unwrap();
        assert_eq!(config.retrieval, RetrievalConfig { k_raw: 10, k_final: 2 });

        let embed = config.models.embed_config(dir.path());
        assert_eq!(embed.cache_dir, dir.path().join("weights"));
        let rerank = config.models.rerank_config(dir.path());
        assert_eq!(rerank.model_name(), "bge-reranker-base");
    }

    #[test]
    fn test_missing_explicit_config_is_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        let err =
            AuditConfig::load(dir.path(), Some(&missing), &ConfigOverrides::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
