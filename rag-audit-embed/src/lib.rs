//! # rag-audit-embed
//!
//! Local model providers for the retrieval audit toolkit: a bi-encoder that
//! turns text into vectors for the recall stage, and a cross-encoder that
//! scores (query, chunk) pairs for the precision stage. Both run ONNX models
//! through FastEmbed, off the async executor.
//!
//! ## Quick Start
//!
//! ```no_run
//! use rag_audit_embed::{EmbedConfig, EmbeddingProvider, FastEmbedProvider};
//! use rag_audit_embed::{FastEmbedReranker, RerankConfig, RerankProvider};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let embedder = FastEmbedProvider::create(EmbedConfig::default()).await?;
//! let vector = embedder.embed_text("How do I renegotiate a debt?").await?;
//! println!("dimension {}", vector.len());
//!
//! let reranker = FastEmbedReranker::create(RerankConfig::default()).await?;
//! let scores = reranker
//!     .score_pairs("How do I renegotiate a debt?", &["Debts may be renegotiated.".to_string()])
//!     .await?;
//! println!("score {}", scores[0]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`config`]: model selection and batching ([`EmbedConfig`], [`RerankConfig`])
//! - [`provider`]: [`EmbeddingProvider`] trait and the FastEmbed bi-encoder
//! - [`reranker`]: [`RerankProvider`] trait and the FastEmbed cross-encoder
//! - [`error`]: [`EmbedError`] and the crate [`Result`] alias
//!
//! Loaded models are cached process-wide, keyed by a hash of their
//! configuration, so building a second provider with the same settings does
//! not reload weights. Embeddings are returned as `f16`.

pub mod config;
pub mod error;
pub mod provider;
pub mod reranker;

pub use config::{DEFAULT_EMBEDDING_MODEL, DEFAULT_RERANKER_MODEL, EmbedConfig, RerankConfig};
pub use error::{EmbedError, Result};
pub use provider::{EmbeddingProvider, EmbeddingResult, FastEmbedProvider};
pub use reranker::{FastEmbedReranker, RerankProvider};
