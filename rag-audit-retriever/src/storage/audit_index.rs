//! Core SQLite database operations for the corpus and the run log.
//!
//! ## Database Schema
//!
//! ```sql
//! -- Corpus chunks produced by the external chunker
//! CREATE TABLE chunks (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     content_hash BLOB UNIQUE,        -- blake3(source, page, content)
//!     source TEXT,                     -- source document name
//!     page INTEGER,                    -- page number, if known
//!     position INTEGER,                -- ordinal within the source
//!     content TEXT,
//!     embedding BLOB,                  -- f16 embedding vector (optional)
//!     created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
//! );
//!
//! -- One row per judged retrieval; timestamp is the merge key
//! CREATE TABLE runs (
//!     id INTEGER PRIMARY KEY AUTOINCREMENT,
//!     timestamp TEXT UNIQUE,           -- RFC 3339, UTC, microseconds
//!     query TEXT,
//!     mode TEXT,                       -- vector_only | reranked
//!     best_index INTEGER,              -- 1-based, 0 when none
//!     hit_rate INTEGER,
//!     mrr REAL,
//!     precision_at_k REAL
//! );
//!
//! -- Snapshot of each retrieved chunk at judging time
//! CREATE TABLE run_chunks (
//!     run_id INTEGER REFERENCES runs(id),
//!     position INTEGER,                -- 1-based rank
//!     chunk_id INTEGER,                -- corpus id at the time, not enforced
//!     chunk_text TEXT,
//!     source TEXT,
//!     page INTEGER,
//!     score REAL,
//!     is_relevant INTEGER,
//!     PRIMARY KEY (run_id, position)
//! );
//! ```
//!
//! `run_chunks.chunk_id` deliberately carries no foreign key: runs are
//! append-only history and imported runs may reference chunks this corpus
//! never had.

use crate::evaluation::{
    EvaluationRun, RunChunk, RunFilter, RunId, RunMetrics, RunOrder, format_timestamp,
    parse_timestamp,
};
use crate::retrieval::RetrievalMode;
use crate::storage::{
    Chunk, ChunkFilter, ChunkId, ChunkMetadata, ContentHash, CorpusStats, ModeAggregate,
};
use anyhow::{Context, Result, anyhow};
use half::f16;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Database file created in the base directory.
pub const DATABASE_FILE_NAME: &str = ".rag-audit.db";

const CHUNK_COLUMNS: &str = "id, content_hash, source, page, position, content, embedding";

/// SQLite-backed corpus and run log.
///
/// Low-level SQL lives here; [`SqliteStore`](super::SqliteStore) exposes it
/// through the storage traits.
#[derive(Clone, Debug)]
pub struct AuditIndex {
    base: PathBuf,
    pool: SqlitePool,
}

impl AuditIndex {
    /// Opens the database in `base`, creating it if needed.
    pub async fn open(base: &Path) -> Result<Self> {
        let db_path = base.join(DATABASE_FILE_NAME);

        let pool = SqlitePool::connect_with(
            SqliteConnectOptions::new()
                .filename(db_path)
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .busy_timeout(std::time::Duration::from_secs(5))
                .foreign_keys(true)
                .create_if_missing(true)
                .auto_vacuum(sqlx::sqlite::SqliteAutoVacuum::Full)
                .page_size(1 << 16)
                .optimize_on_close(true, 1 << 10),
        )
        .await
        .with_context(|| format!("failed to open database in {}", base.display()))?;
        Self::new_with_pool(base, pool).await
    }

    /// Opens an in-memory database for testing.
    ///
    /// The pool holds exactly one connection that never expires, since every
    /// SQLite memory connection is its own database.
    pub async fn open_memory(base: &Path) -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        Self::new_with_pool(base, pool).await
    }

    async fn new_with_pool(base: &Path, pool: SqlitePool) -> Result<Self> {
        Self::create_tables(&pool).await?;

        Ok(Self {
            base: base.to_path_buf(),
            pool,
        })
    }

    async fn create_tables(pool: &SqlitePool) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chunks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content_hash BLOB NOT NULL UNIQUE,
                source TEXT NOT NULL,
                page INTEGER,
                position INTEGER NOT NULL,
                content TEXT NOT NULL,
                embedding BLOB,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL UNIQUE,
                query TEXT NOT NULL,
                mode TEXT NOT NULL CHECK (mode IN ('vector_only', 'reranked')),
                best_index INTEGER NOT NULL DEFAULT 0,
                hit_rate INTEGER NOT NULL CHECK (hit_rate IN (0, 1)),
                mrr REAL NOT NULL,
                precision_at_k REAL NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS run_chunks (
                run_id INTEGER NOT NULL,
                position INTEGER NOT NULL,
                chunk_id INTEGER,
                chunk_text TEXT NOT NULL,
                source TEXT NOT NULL,
                page INTEGER,
                score REAL NOT NULL,
                is_relevant INTEGER NOT NULL,
                PRIMARY KEY (run_id, position),
                FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_chunks_source ON chunks(source, position)")
            .execute(pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_runs_mode ON runs(mode, timestamp)")
            .execute(pool)
            .await?;

        Ok(())
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Inserts chunks, returning their IDs in input order.
    ///
    /// Existing chunks (same content hash) keep their row; an incoming
    /// embedding only fills a missing one.
    pub async fn upsert_chunks(&self, chunks: &[Chunk]) -> Result<Vec<ChunkId>> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(chunks.len());

        for chunk in chunks {
            let embedding_bytes = chunk.embedding.as_deref().map(embedding_to_bytes);

            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO chunks (content_hash, source, page, position, content, embedding)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT(content_hash) DO UPDATE SET
                    embedding = COALESCE(chunks.embedding, excluded.embedding)
                RETURNING id
                "#,
            )
            .bind(&chunk.content_hash[..])
            .bind(&chunk.source)
            .bind(chunk.page.map(i64::from))
            .bind(chunk.position as i64)
            .bind(&chunk.content)
            .bind(embedding_bytes)
            .fetch_one(&mut *tx)
            .await?;
            ids.push(id);
        }

        tx.commit().await?;
        Ok(ids)
    }

    /// Get a chunk by ID
    pub async fn get_chunk_by_id(&self, id: ChunkId) -> Result<Option<Chunk>> {
        let row = sqlx::query(&format!("SELECT {CHUNK_COLUMNS} FROM chunks WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(chunk_from_row).transpose()
    }

    /// Every chunk, ordered by source and position
    pub async fn get_all_chunks(&self) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks ORDER BY source, position, id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(chunk_from_row).collect()
    }

    /// Get all chunks with embeddings
    pub async fn get_all_chunks_with_embeddings(&self) -> Result<Vec<Chunk>> {
        let rows = sqlx::query(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE embedding IS NOT NULL ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(chunk_from_row).collect()
    }

    /// Update a chunk's embedding by ID
    pub async fn update_chunk_embedding(&self, id: ChunkId, embedding: &[f16]) -> Result<()> {
        let result = sqlx::query("UPDATE chunks SET embedding = ?1 WHERE id = ?2")
            .bind(embedding_to_bytes(embedding))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(anyhow!("no chunk with id {id}"));
        }
        Ok(())
    }

    pub async fn list_chunk_metadata(&self, filter: &ChunkFilter) -> Result<Vec<ChunkMetadata>> {
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT id, source, page, position, length(content) AS content_length, \
             embedding IS NOT NULL AS has_embedding FROM chunks",
        );
        let mut separator = " WHERE ";
        if let Some(source) = &filter.source {
            query.push(separator).push("source = ").push_bind(source.clone());
            separator = " AND ";
        }
        match filter.has_embedding {
            Some(true) => {
                query.push(separator).push("embedding IS NOT NULL");
            }
            Some(false) => {
                query.push(separator).push("embedding IS NULL");
            }
            None => {}
        }
        query.push(" ORDER BY source, position, id");
        if let Some(limit) = filter.limit {
            query.push(" LIMIT ").push_bind(limit as i64);
        }

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                Ok(ChunkMetadata {
                    id: row.try_get("id")?,
                    source: row.try_get("source")?,
                    page: page_from_row(row, "page")?,
                    position: row.try_get::<i64, _>("position")? as usize,
                    content_length: row.try_get::<i64, _>("content_length")? as usize,
                    has_embedding: row.try_get::<i64, _>("has_embedding")? != 0,
                })
            })
            .collect()
    }

    pub async fn search_text(&self, search_term: &str, case_sensitive: bool) -> Result<Vec<Chunk>> {
        let escaped_term = search_term
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let like_pattern = format!("%{escaped_term}%");

        // LIKE is case-insensitive for ASCII by default; instr() is not
        let sql = if case_sensitive {
            format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks WHERE instr(content, ?1) > 0 \
                 ORDER BY source, position, id"
            )
        } else {
            format!(
                "SELECT {CHUNK_COLUMNS} FROM chunks WHERE content LIKE ?1 ESCAPE '\\' \
                 ORDER BY source, position, id"
            )
        };
        let bound = if case_sensitive {
            search_term.to_string()
        } else {
            like_pattern
        };

        let rows = sqlx::query(&sql).bind(bound).fetch_all(&self.pool).await?;
        rows.iter().map(chunk_from_row).collect()
    }

    pub async fn corpus_stats(&self) -> Result<CorpusStats> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS chunk_count, COUNT(embedding) AS embedded_count, \
             COUNT(DISTINCT source) AS source_count FROM chunks",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(CorpusStats {
            chunk_count: row.try_get::<i64, _>("chunk_count")? as usize,
            embedded_chunk_count: row.try_get::<i64, _>("embedded_count")? as usize,
            source_count: row.try_get::<i64, _>("source_count")? as usize,
        })
    }

    pub async fn count_embedded_chunks(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE embedding IS NOT NULL")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }

    /// Inserts a run and its chunk snapshots in one transaction.
    ///
    /// Returns `None` when the timestamp is already taken; nothing is written
    /// in that case.
    pub async fn insert_run(&self, run: &EvaluationRun) -> Result<Option<RunId>> {
        let mut tx = self.pool.begin().await?;

        let run_id: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO runs (timestamp, query, mode, best_index, hit_rate, mrr, precision_at_k)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(timestamp) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(format_timestamp(&run.timestamp))
        .bind(&run.query)
        .bind(run.mode.as_str())
        .bind(run.best_index.unwrap_or(0) as i64)
        .bind(i64::from(run.metrics.hit_rate))
        .bind(run.metrics.mrr)
        .bind(run.metrics.precision_at_k)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(run_id) = run_id else {
            tx.rollback().await?;
            return Ok(None);
        };

        for chunk in &run.chunks {
            sqlx::query(
                r#"
                INSERT INTO run_chunks
                    (run_id, position, chunk_id, chunk_text, source, page, score, is_relevant)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(run_id)
            .bind(chunk.position as i64)
            .bind(chunk.chunk_id)
            .bind(&chunk.text)
            .bind(&chunk.source)
            .bind(chunk.page.map(i64::from))
            .bind(f64::from(chunk.score))
            .bind(chunk.is_relevant)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Some(run_id))
    }

    /// Runs matching the filter with their chunk snapshots, read from one
    /// snapshot of the database.
    pub async fn select_runs(&self, filter: &RunFilter, order: RunOrder) -> Result<Vec<EvaluationRun>> {
        let mut tx = self.pool.begin().await?;

        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT id, timestamp, query, mode, best_index, hit_rate, mrr, precision_at_k FROM runs",
        );
        push_run_filter(&mut query, filter, "");
        query.push(match order {
            RunOrder::NewestFirst => " ORDER BY timestamp DESC, id DESC",
            RunOrder::OldestFirst => " ORDER BY timestamp ASC, id ASC",
        });
        let run_rows = query.build().fetch_all(&mut *tx).await?;

        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT rc.run_id, rc.position, rc.chunk_id, rc.chunk_text, rc.source, rc.page, \
             rc.score, rc.is_relevant FROM run_chunks rc JOIN runs r ON r.id = rc.run_id",
        );
        push_run_filter(&mut query, filter, "r.");
        query.push(" ORDER BY rc.run_id, rc.position");
        let chunk_rows = query.build().fetch_all(&mut *tx).await?;

        tx.commit().await?;

        let mut chunks_by_run: HashMap<RunId, Vec<RunChunk>> = HashMap::new();
        for row in &chunk_rows {
            let run_id: RunId = row.try_get("run_id")?;
            chunks_by_run
                .entry(run_id)
                .or_default()
                .push(run_chunk_from_row(row)?);
        }

        run_rows
            .iter()
            .map(|row| {
                let mut run = run_from_row(row)?;
                if let Some(id) = run.id {
                    run.chunks = chunks_by_run.remove(&id).unwrap_or_default();
                }
                Ok(run)
            })
            .collect()
    }

    pub async fn aggregate_runs(&self, filter: &RunFilter) -> Result<Vec<ModeAggregate>> {
        let mut query = QueryBuilder::<Sqlite>::new(
            "SELECT mode, COUNT(*) AS run_count, AVG(hit_rate) AS mean_hit_rate, \
             AVG(mrr) AS mean_mrr, AVG(precision_at_k) AS mean_precision_at_k FROM runs",
        );
        push_run_filter(&mut query, filter, "");
        query.push(" GROUP BY mode ORDER BY mode");

        let rows = query.build().fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| {
                let mode: String = row.try_get("mode")?;
                Ok(ModeAggregate {
                    mode: RetrievalMode::from_str(&mode)?,
                    run_count: row.try_get::<i64, _>("run_count")? as usize,
                    mean_hit_rate: row.try_get("mean_hit_rate")?,
                    mean_mrr: row.try_get("mean_mrr")?,
                    mean_precision_at_k: row.try_get("mean_precision_at_k")?,
                })
            })
            .collect()
    }

    pub async fn count_runs(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM runs")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}

/// Appends `WHERE ...` for a run filter. `alias` prefixes the `runs` columns.
fn push_run_filter(query: &mut QueryBuilder<'_, Sqlite>, filter: &RunFilter, alias: &str) {
    let mut separator = " WHERE ";
    if let Some(mode) = filter.mode {
        query
            .push(separator)
            .push(alias)
            .push("mode = ")
            .push_bind(mode.as_str());
        separator = " AND ";
    }
    // Canonical timestamps sort lexicographically in time order
    if let Some(since) = &filter.since {
        query
            .push(separator)
            .push(alias)
            .push("timestamp >= ")
            .push_bind(format_timestamp(since));
        separator = " AND ";
    }
    if let Some(until) = &filter.until {
        query
            .push(separator)
            .push(alias)
            .push("timestamp <= ")
            .push_bind(format_timestamp(until));
        separator = " AND ";
    }
    if let Some(term) = &filter.query_contains {
        query
            .push(separator)
            .push("instr(lower(")
            .push(alias)
            .push("query), lower(")
            .push_bind(term.clone())
            .push(")) > 0");
    }
}

fn embedding_to_bytes(embedding: &[f16]) -> &[u8] {
    bytemuck::cast_slice::<f16, u8>(embedding)
}

fn embedding_from_bytes(bytes: &[u8]) -> Vec<f16> {
    // Blobs come back in a byte buffer that need not be 2-aligned
    match bytemuck::try_cast_slice::<u8, f16>(bytes) {
        Ok(embedding) => embedding.to_vec(),
        Err(_) => bytes
            .chunks_exact(2)
            .map(|pair| f16::from_ne_bytes([pair[0], pair[1]]))
            .collect(),
    }
}

fn page_from_row(row: &SqliteRow, column: &str) -> Result<Option<u32>> {
    let page: Option<i64> = row.try_get(column)?;
    page.map(|p| u32::try_from(p).with_context(|| format!("page {p} out of range")))
        .transpose()
}

fn chunk_from_row(row: &SqliteRow) -> Result<Chunk> {
    let hash_bytes: Vec<u8> = row.try_get("content_hash")?;
    let content_hash: ContentHash = hash_bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("content hash has {} bytes, expected 32", hash_bytes.len()))?;
    let embedding: Option<Vec<u8>> = row.try_get("embedding")?;

    Ok(Chunk {
        id: Some(row.try_get("id")?),
        content_hash,
        source: row.try_get("source")?,
        page: page_from_row(row, "page")?,
        position: row.try_get::<i64, _>("position")? as usize,
        content: row.try_get("content")?,
        embedding: embedding.as_deref().map(embedding_from_bytes),
    })
}

fn run_from_row(row: &SqliteRow) -> Result<EvaluationRun> {
    let timestamp: String = row.try_get("timestamp")?;
    let mode: String = row.try_get("mode")?;
    let best_index: i64 = row.try_get("best_index")?;
    let hit_rate: i64 = row.try_get("hit_rate")?;

    Ok(EvaluationRun {
        id: Some(row.try_get("id")?),
        timestamp: parse_timestamp(&timestamp)
            .ok_or_else(|| anyhow!("stored run has unparseable timestamp {timestamp:?}"))?,
        query: row.try_get("query")?,
        mode: RetrievalMode::from_str(&mode)?,
        best_index: (best_index > 0).then_some(best_index as usize),
        metrics: RunMetrics {
            hit_rate: u8::from(hit_rate != 0),
            mrr: row.try_get("mrr")?,
            precision_at_k: row.try_get("precision_at_k")?,
        },
        chunks: Vec::new(),
    })
}

fn run_chunk_from_row(row: &SqliteRow) -> Result<RunChunk> {
    let score: f64 = row.try_get("score")?;
    Ok(RunChunk {
        position: row.try_get::<i64, _>("position")? as usize,
        chunk_id: row.try_get("chunk_id")?,
        source: row.try_get("source")?,
        page: page_from_row(row, "page")?,
        text: row.try_get("chunk_text")?,
        score: score as f32,
        is_relevant: row.try_get::<i64, _>("is_relevant")? != 0,
    })
}
