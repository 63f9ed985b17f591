//! rag-audit-retriever: two-stage retrieval with a built-in quality audit
//!
//! Answers a query with the chunks of a document corpus that best support it,
//! either straight from an embedding index or after a cross-encoder rescoring
//! pass, and keeps a record of how good those answers were judged to be.
//!
//! ## Key Modules
//!
//! - **[`retrieval`]**: recall by embedding similarity, optional reranking, ingestion
//! - **[`evaluation`]**: judged runs, metric aggregation, XML export/import
//! - **[`storage`]**: storage traits with the SQLite implementation
//! - **[`config`]**: `rag-audit.toml` loading and validation
//! - **[`error`]**: error types at the crate boundaries
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rag_audit_embed::{FastEmbedProvider, FastEmbedReranker};
//! use rag_audit_retriever::{
//!     config::AuditConfig,
//!     evaluation::{EvaluationRecorder, Judgment},
//!     retrieval::{CrossEncoderScorer, RetrievalMode, Retriever, VectorIndex},
//!     storage::{AuditIndex, SqliteStore},
//! };
//! use std::{path::Path, sync::Arc};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let base = Path::new(".");
//! let config = AuditConfig::default();
//! let store = Arc::new(SqliteStore::new(AuditIndex::open(base).await?));
//!
//! let embedder = Arc::new(FastEmbedProvider::create(config.models.embed_config(base)).await?);
//! let reranker = Arc::new(FastEmbedReranker::create(config.models.rerank_config(base)).await?);
//! let retriever = Retriever::new(config.retrieval, Arc::new(VectorIndex::new(store.clone(), embedder)))
//!     .with_scorer(Arc::new(CrossEncoderScorer::new(reranker)));
//!
//! let result = retriever.retrieve("How do I renegotiate a debt?", RetrievalMode::Reranked).await?;
//! let judgment = Judgment::from_positions(result.len(), &[1], Some(1))?;
//! EvaluationRecorder::new(store)
//!     .record("How do I renegotiate a debt?", RetrievalMode::Reranked, &result, &judgment)
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! chunks.json → ingest → SQLite chunks ← VectorIndex ← Retriever → CrossEncoderScorer
//!                                                         ↓
//!                      export/import ↔ SQLite runs ← EvaluationRecorder ← Judgment
//!                                          ↓
//!                                  MetricsAggregator
//! ```

pub mod config;
pub mod error;
pub mod evaluation;
pub mod retrieval;
pub mod storage;

pub use config::{AuditConfig, ConfigOverrides, RetrievalConfig};
pub use error::{ExchangeError, RecordError, RetrieveError, Stage};
