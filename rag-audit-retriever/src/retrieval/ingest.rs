//! Loading pre-chunked documents into the corpus store.
//!
//! Chunking itself happens upstream. This module takes its output, a JSON
//! array of `{source, page, content}` objects, embeds each chunk and upserts
//! it. Re-ingesting the same file is a no-op apart from filling embeddings
//! that failed to generate the first time.

use crate::storage::{Chunk, ChunkStore, CombinedStore};
use anyhow::{Context, Result};
use rag_audit_embed::EmbeddingProvider;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, info, warn};

/// One chunk as produced by the external chunker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestChunk {
    pub source: String,
    #[serde(default)]
    pub page: Option<u32>,
    pub content: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub received: usize,
    pub skipped_empty: usize,
    pub stored: usize,
    pub newly_added: usize,
    pub embeddings_generated: usize,
}

pub fn parse_chunks(json: &str) -> Result<Vec<IngestChunk>> {
    serde_json::from_str(json).context("expected a JSON array of {source, page, content} objects")
}

pub async fn read_chunks_file(path: &Path) -> Result<Vec<IngestChunk>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_chunks(&text).with_context(|| format!("failed to parse {}", path.display()))
}

/// Embed and store chunks, `batch_size` at a time.
///
/// Chunks are numbered per source in input order. A batch whose embeddings
/// fail is stored without them and logged.
pub async fn ingest_chunks(
    store: &dyn CombinedStore,
    embedder: &dyn EmbeddingProvider,
    chunks: Vec<IngestChunk>,
    batch_size: usize,
) -> Result<IngestReport> {
    let mut report = IngestReport {
        received: chunks.len(),
        ..IngestReport::default()
    };
    let before = store.corpus_stats().await?.chunk_count;

    let mut next_position: HashMap<String, usize> = HashMap::new();
    let mut pending = Vec::new();
    for item in chunks {
        if item.content.trim().is_empty() {
            report.skipped_empty += 1;
            continue;
        }
        let position = next_position.entry(item.source.clone()).or_insert(0);
        pending.push(Chunk::new(item.source, item.page, *position, item.content));
        *position += 1;
    }

    for batch in pending.chunks(batch_size.max(1)) {
        let mut batch = batch.to_vec();
        let texts: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();

        match embedder.embed_texts(&texts).await {
            Ok(result) => {
                for (chunk, embedding) in batch.iter_mut().zip(result.embeddings) {
                    chunk.embedding = Some(embedding);
                    report.embeddings_generated += 1;
                }
            }
            Err(e) => {
                warn!("Failed to generate embeddings for {} chunks: {}", texts.len(), e);
            }
        }

        let ids = store.insert_chunks(batch).await?;
        report.stored += ids.len();
        debug!("Stored batch of {} chunks", ids.len());
    }

    report.newly_added = store.corpus_stats().await?.chunk_count.saturating_sub(before);
    info!(
        received = report.received,
        stored = report.stored,
        new = report.newly_added,
        embedded = report.embeddings_generated,
        "Ingestion complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{AuditIndex, ChunkFilter, EmbeddingStore, SqliteStore};
    use async_trait::async_trait;
    use half::f16;
    use rag_audit_embed::{EmbedError, EmbeddingResult};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    struct LengthEmbedder {
        fail: AtomicBool,
    }

    #[async_trait]
    impl EmbeddingProvider for LengthEmbedder {
        async fn embed_text(&self, text: &str) -> rag_audit_embed::Result<Vec<f16>> {
            Ok(vec![f16::from_f32(text.len() as f32), f16::ONE])
        }

        async fn embed_texts(&self, texts: &[String]) -> rag_audit_embed::Result<EmbeddingResult> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(EmbedError::embedding_gen(anyhow::anyhow!("out of memory")));
            }
            let mut embeddings = Vec::new();
            for text in texts {
                embeddings.push(self.embed_text(text).await?);
            }
            Ok(EmbeddingResult::new(embeddings))
        }

        fn embedding_dimension(&self) -> usize {
            2
        }

        fn provider_name(&self) -> &str {
            "length"
        }
    }

    const CHUNKS_JSON: &str = r#"[
        {"source": "guide.pdf", "page": 1, "content": "Taxes can be paid in installments."},
        {"source": "guide.pdf", "page": 1, "content": "   "},
        {"source": "guide.pdf", "page": 2, "content": "Debts may be renegotiated."},
        {"source": "faq.pdf", "content": "Call the help line."}
    ]"#;

    #[test]
    fn test_parse_chunks() {
        let chunks = parse_chunks(CHUNKS_JSON).unwrap();
        assert_eq!(chunks.len(), 4);
        assert_eq!(chunks[3].page, None);
        assert!(parse_chunks("{\"source\": \"x\"}").is_err());
    }

    #[tokio::test]
    async fn test_ingest_is_idempotent_and_backfills() -> Result<()> {
        let dir = tempdir()?;
        let store = SqliteStore::new(AuditIndex::open_memory(dir.path()).await?);
        let embedder = LengthEmbedder {
            fail: AtomicBool::new(true),
        };

        let report = ingest_chunks(&store, &embedder, parse_chunks(CHUNKS_JSON)?, 2).await?;
        assert_eq!(report.received, 4);
        assert_eq!(report.skipped_empty, 1);
        assert_eq!(report.stored, 3);
        assert_eq!(report.newly_added, 3);
        assert_eq!(report.embeddings_generated, 0);
        assert_eq!(store.count_embedded_chunks().await?, 0);

        embedder.fail.store(false, Ordering::SeqCst);
        let report = ingest_chunks(&store, &embedder, parse_chunks(CHUNKS_JSON)?, 2).await?;
        assert_eq!(report.newly_added, 0);
        assert_eq!(report.embeddings_generated, 3);
        assert_eq!(store.count_embedded_chunks().await?, 3);

        let listed = store.list_chunks(ChunkFilter::default()).await?;
        let positions: Vec<_> = listed.iter().map(|m| (m.source.as_str(), m.position)).collect();
        assert_eq!(positions, vec![("faq.pdf", 0), ("guide.pdf", 0), ("guide.pdf", 1)]);
        Ok(())
    }
}
