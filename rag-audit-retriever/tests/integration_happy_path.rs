//! Integration tests for the retrieve → judge → aggregate → exchange flow
//!
//! These tests drive the public API end to end:
//! - Ingesting pre-chunked JSON into an in-memory store
//! - Retrieving with and without the rescoring stage
//! - Recording judgments and summarizing them per mode
//! - Moving the run history to a fresh store through the XML exchange
//!
//! The models are replaced by deterministic fakes except in the ignored test,
//! which downloads the real ONNX weights.

use anyhow::Result;
use async_trait::async_trait;
use half::f16;
use rag_audit_embed::{EmbeddingProvider, EmbeddingResult, RerankProvider};
use rag_audit_retriever::{
    config::RetrievalConfig,
    error::{RetrieveError, Stage},
    evaluation::{
        EvaluationRecorder, ImportReport, Judgment, MetricsAggregator, RunExchange, RunFilter,
    },
    retrieval::{
        CrossEncoderScorer, RetrievalMode, Retriever, VectorIndex,
        ingest::{ingest_chunks, parse_chunks},
    },
    storage::{AuditIndex, SqliteStore},
};
use std::sync::Arc;
use tempfile::tempdir;

const VOCABULARY: [&str; 4] = ["tax", "debt", "installment", "penalty"];

/// Bag-of-words vectors over a tiny vocabulary.
struct VocabularyEmbedder;

impl VocabularyEmbedder {
    fn vector(text: &str) -> Vec<f16> {
        let text = text.to_lowercase();
        VOCABULARY
            .iter()
            .map(|word| f16::from_f32(text.matches(word).count() as f32))
            .collect()
    }
}

#[async_trait]
impl EmbeddingProvider for VocabularyEmbedder {
    async fn embed_text(&self, text: &str) -> rag_audit_embed::Result<Vec<f16>> {
        Ok(Self::vector(text))
    }

    async fn embed_texts(&self, texts: &[String]) -> rag_audit_embed::Result<EmbeddingResult> {
        Ok(EmbeddingResult::new(texts.iter().map(|t| Self::vector(t)).collect()))
    }

    fn embedding_dimension(&self) -> usize {
        VOCABULARY.len()
    }

    fn provider_name(&self) -> &str {
        "vocabulary"
    }
}

/// Prefers chunks mentioning "penalty", whatever the query.
struct PenaltyReranker {
    available: bool,
}

#[async_trait]
impl RerankProvider for PenaltyReranker {
    async fn score_pairs(&self, _query: &str, texts: &[String]) -> rag_audit_embed::Result<Vec<f32>> {
        if !self.available {
            return Err(rag_audit_embed::EmbedError::model_init(anyhow::anyhow!(
                "weights not downloaded"
            )));
        }
        Ok(texts
            .iter()
            .map(|t| if t.contains("penalty") { 5.0 } else { -(t.len() as f32) / 100.0 })
            .collect())
    }

    fn provider_name(&self) -> &str {
        "penalty"
    }
}

/// A cross-encoder whose output has gone numerically bad.
struct NanReranker;

#[async_trait]
impl RerankProvider for NanReranker {
    async fn score_pairs(&self, _query: &str, texts: &[String]) -> rag_audit_embed::Result<Vec<f32>> {
        Ok(vec![f32::NAN; texts.len()])
    }

    fn provider_name(&self) -> &str {
        "nan"
    }
}

const CORPUS: &str = r#"[
    {"source": "guide.pdf", "page": 1, "content": "A tax debt can be paid in installments."},
    {"source": "guide.pdf", "page": 2, "content": "Late tax payments carry a penalty."},
    {"source": "guide.pdf", "page": 3, "content": "Each installment is due monthly."},
    {"source": "faq.pdf", "content": "Debt renegotiation requires an appointment."},
    {"source": "faq.pdf", "content": "Opening hours are nine to five."}
]"#;

async fn setup(reranker_available: bool) -> Result<(Arc<SqliteStore>, Retriever)> {
    let dir = tempdir()?;
    let store = Arc::new(SqliteStore::new(AuditIndex::open_memory(dir.path()).await?));
    let embedder = Arc::new(VocabularyEmbedder);

    let report = ingest_chunks(store.as_ref(), embedder.as_ref(), parse_chunks(CORPUS)?, 2).await?;
    assert_eq!(report.stored, 5);

    let retriever = Retriever::new(
        RetrievalConfig::new(4, 2)?,
        Arc::new(VectorIndex::new(store.clone(), embedder)),
    )
    .with_scorer(Arc::new(CrossEncoderScorer::new(Arc::new(PenaltyReranker {
        available: reranker_available,
    }))));
    Ok((store, retriever))
}

#[tokio::test]
async fn test_full_audit_cycle() -> Result<()> {
    let (store, retriever) = setup(true).await?;
    let recorder = EvaluationRecorder::new(store.clone());
    let query = "tax debt installment";

    let vector = retriever.retrieve(query, RetrievalMode::VectorOnly).await?;
    assert_eq!(vector.len(), 2);
    assert_eq!(vector.hits[0].chunk.content, "A tax debt can be paid in installments.");
    assert!(vector.scores().windows(2).all(|w| w[0] >= w[1]));

    let reranked = retriever.retrieve(query, RetrievalMode::Reranked).await?;
    assert_eq!(reranked.len(), 2);
    assert_eq!(reranked.hits[0].chunk.content, "Late tax payments carry a penalty.");
    assert!(reranked.scores().windows(2).all(|w| w[0] >= w[1]));

    // The judge wanted the penalty chunk: vector search missed it, the
    // rescoring pass put it first.
    let vector_relevant: Vec<usize> = vector
        .iter()
        .enumerate()
        .filter(|(_, hit)| hit.chunk.content.contains("penalty"))
        .map(|(i, _)| i + 1)
        .collect();
    let vector_best = vector_relevant.first().copied();
    recorder
        .record(
            query,
            RetrievalMode::VectorOnly,
            &vector,
            &Judgment::from_positions(vector.len(), &vector_relevant, vector_best)?,
        )
        .await?;
    recorder
        .record(
            query,
            RetrievalMode::Reranked,
            &reranked,
            &Judgment::from_positions(reranked.len(), &[1], Some(1))?,
        )
        .await?;

    let comparison = MetricsAggregator::new(store.clone())
        .compare(&RunFilter::default())
        .await?;
    assert_eq!(comparison.vector_only.run_count, 1);
    assert_eq!(comparison.reranked.mean_mrr, Some(1.0));
    assert!(comparison.mrr_delta.unwrap() > 0.0);

    // Move the history to a fresh store
    let xml = RunExchange::new(store.clone()).export_runs().await?;
    let dir = tempdir()?;
    let fresh = Arc::new(SqliteStore::new(AuditIndex::open_memory(dir.path()).await?));
    let report = RunExchange::new(fresh.clone()).import_runs(&xml).await?;
    assert_eq!(
        report,
        ImportReport {
            added: 2,
            skipped_duplicate: 0,
            malformed: 0
        }
    );
    let moved = MetricsAggregator::new(fresh).compare(&RunFilter::default()).await?;
    assert_eq!(moved, comparison);
    Ok(())
}

#[tokio::test]
async fn test_reranked_with_small_corpus() -> Result<()> {
    let dir = tempdir()?;
    let store = Arc::new(SqliteStore::new(AuditIndex::open_memory(dir.path()).await?));
    let embedder = Arc::new(VocabularyEmbedder);
    let two = r#"[
        {"source": "a.pdf", "content": "tax penalty"},
        {"source": "a.pdf", "content": "debt"}
    ]"#;
    ingest_chunks(store.as_ref(), embedder.as_ref(), parse_chunks(two)?, 8).await?;

    let retriever = Retriever::new(
        RetrievalConfig::new(20, 3)?,
        Arc::new(VectorIndex::new(store, embedder)),
    )
    .with_scorer(Arc::new(CrossEncoderScorer::new(Arc::new(PenaltyReranker {
        available: true,
    }))));

    let result = retriever.retrieve("tax", RetrievalMode::Reranked).await?;
    assert_eq!(result.len(), 2);
    assert_eq!(result.hits[0].chunk.content, "tax penalty");
    Ok(())
}

#[tokio::test]
async fn test_unavailable_reranker_is_distinguishable() -> Result<()> {
    let (_store, retriever) = setup(false).await?;

    let err = retriever
        .retrieve("tax", RetrievalMode::Reranked)
        .await
        .unwrap_err();
    assert!(err.is_upstream_unavailable());
    assert!(matches!(
        err,
        RetrieveError::UpstreamUnavailable {
            stage: Stage::Rerank,
            ..
        }
    ));

    // Vector-only still answers
    let result = retriever.retrieve("tax", RetrievalMode::VectorOnly).await?;
    assert!(!result.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_nan_rerank_scores_never_reach_the_log() -> Result<()> {
    let (store, retriever) = setup(true).await?;
    let retriever = retriever.with_scorer(Arc::new(CrossEncoderScorer::new(Arc::new(NanReranker))));
    let recorder = EvaluationRecorder::new(store.clone());

    let err = retriever
        .retrieve("tax", RetrievalMode::Reranked)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RetrieveError::UpstreamUnavailable {
            stage: Stage::Rerank,
            ..
        }
    ));

    // Vector-only results still record and travel through the exchange
    let vector = retriever.retrieve("tax", RetrievalMode::VectorOnly).await?;
    recorder
        .record(
            "tax",
            RetrievalMode::VectorOnly,
            &vector,
            &Judgment::from_positions(vector.len(), &[1], Some(1))?,
        )
        .await?;

    let xml = RunExchange::new(store.clone()).export_runs().await?;
    let dir = tempdir()?;
    let fresh = Arc::new(SqliteStore::new(AuditIndex::open_memory(dir.path()).await?));
    let report = RunExchange::new(fresh).import_runs(&xml).await?;
    assert_eq!(report.added, 1);
    assert_eq!(report.malformed, 0);
    Ok(())
}

#[tokio::test]
async fn test_empty_corpus_is_no_evidence() -> Result<()> {
    let dir = tempdir()?;
    let store = Arc::new(SqliteStore::new(AuditIndex::open_memory(dir.path()).await?));
    let retriever = Retriever::new(
        RetrievalConfig::default(),
        Arc::new(VectorIndex::new(store, Arc::new(VocabularyEmbedder))),
    );

    for mode in RetrievalMode::ALL {
        let result = retriever.retrieve("anything", mode).await?;
        assert!(result.is_empty());
        assert_eq!(result.mode, mode);
    }
    Ok(())
}

/// Downloads the default bi-encoder and cross-encoder.
#[tokio::test]
#[ignore]
async fn test_with_real_models() -> Result<()> {
    use rag_audit_embed::{EmbedConfig, FastEmbedProvider, FastEmbedReranker, RerankConfig};

    let dir = tempdir()?;
    let store = Arc::new(SqliteStore::new(AuditIndex::open_memory(dir.path()).await?));
    let embedder = Arc::new(FastEmbedProvider::create(EmbedConfig::default()).await?);
    let reranker = Arc::new(FastEmbedReranker::create(RerankConfig::default()).await?);

    ingest_chunks(store.as_ref(), embedder.as_ref(), parse_chunks(CORPUS)?, 8).await?;
    let retriever = Retriever::new(
        RetrievalConfig::new(5, 2)?,
        Arc::new(VectorIndex::new(store, embedder)),
    )
    .with_scorer(Arc::new(CrossEncoderScorer::new(reranker)));

    let result = retriever
        .retrieve("What happens if I pay my taxes late?", RetrievalMode::Reranked)
        .await?;
    assert_eq!(result.len(), 2);
    assert!(result.hits.iter().any(|hit| hit.chunk.content.contains("penalty")));
    Ok(())
}
