//! Error types for the model providers

/// Result type for embedding and reranking operations.
pub type Result<T> = std::result::Result<T, EmbedError>;

/// Error type for all model provider operations.
///
/// Every variant means the model could not produce an answer. Callers that
/// need to distinguish "the model is unavailable" from "the model answered
/// with nothing" should treat any `EmbedError` as the former.
///
/// # Error Categories
///
/// - **Configuration Errors**: unknown model names, zero batch sizes
/// - **Initialization Errors**: failures while loading ONNX weights
/// - **Runtime Errors**: failures while embedding or scoring
/// - **Task Errors**: the blocking worker panicked or was cancelled
#[derive(Debug, thiserror::Error)]
pub enum EmbedError {
    /// Error when model configuration is invalid
    #[error("Invalid model configuration: {message}")]
    InvalidConfig { message: String },

    /// Error during model initialization
    #[error("Model initialization failed: {source}")]
    ModelInitialization {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Error during embedding generation
    #[error("Embedding generation failed: {source}")]
    EmbeddingGeneration {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Error while scoring (query, document) pairs
    #[error("Reranking failed: {source}")]
    Reranking {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// IO errors when preparing the model cache directory
    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Async task join errors
    #[error("Async task failed: {source}")]
    AsyncTask {
        #[from]
        source: tokio::task::JoinError,
    },

    /// Generic errors from other libraries
    #[error("External error: {source}")]
    External {
        #[from]
        source: anyhow::Error,
    },
}

impl EmbedError {
    /// Wrap an error raised while loading a model.
    pub fn model_init<E>(source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::ModelInitialization {
            source: source.into(),
        }
    }

    /// Wrap an error raised while generating embeddings.
    pub fn embedding_gen<E>(source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::EmbeddingGeneration {
            source: source.into(),
        }
    }

    /// Wrap an error raised while scoring pairs with a cross-encoder.
    pub fn reranking<E>(source: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Self::Reranking {
            source: source.into(),
        }
    }

    /// Create an invalid configuration error with a custom message.
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EmbedError::invalid_config("batch_size must be at least 1");
        assert_eq!(
            err.to_string(),
            "Invalid model configuration: batch_size must be at least 1"
        );

        let err = EmbedError::reranking(anyhow::anyhow!("session closed"));
        assert!(err.to_string().starts_with("Reranking failed"));
        assert!(err.to_string().contains("session closed"));
    }
}
