//! Turning one judged retrieval into a stored [`EvaluationRun`].

use super::{EvaluationRun, Judgment, RunChunk, now_timestamp};
use crate::error::RecordError;
use crate::retrieval::{RetrievalMode, RetrievalResult};
use crate::storage::RunStore;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info};

/// Attempts at finding a free timestamp before giving up.
const MAX_TIMESTAMP_ATTEMPTS: u32 = 1_000;

pub struct EvaluationRecorder {
    store: Arc<dyn RunStore>,
}

impl EvaluationRecorder {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Validate a judgment, compute its metrics and append the run.
    ///
    /// The run gets the current time at microsecond resolution as its
    /// timestamp. If another run already holds that instant, the timestamp is
    /// moved forward one microsecond at a time until the insert succeeds.
    /// Results carrying NaN or infinite scores are rejected.
    pub async fn record(
        &self,
        query: &str,
        mode: RetrievalMode,
        result: &RetrievalResult,
        judgment: &Judgment,
    ) -> Result<EvaluationRun, RecordError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(RecordError::EmptyQuery);
        }
        if result.mode != mode {
            return Err(RecordError::InconsistentJudgment(format!(
                "result was retrieved as {} but recorded as {}",
                result.mode, mode
            )));
        }
        judgment.validate(result.len())?;
        if let Some(index) = result.iter().position(|hit| !hit.score.is_finite()) {
            return Err(RecordError::InconsistentJudgment(format!(
                "chunk {} has non-finite score {}",
                index + 1,
                result.hits[index].score
            )));
        }

        let chunks = result
            .iter()
            .zip(judgment.relevant())
            .enumerate()
            .map(|(index, (hit, is_relevant))| RunChunk {
                position: index + 1,
                chunk_id: hit.chunk.id,
                source: hit.chunk.source.clone(),
                page: hit.chunk.page,
                text: hit.chunk.content.clone(),
                score: hit.score,
                is_relevant: *is_relevant,
            })
            .collect();

        let mut run = EvaluationRun {
            id: None,
            timestamp: now_timestamp(),
            query: query.to_string(),
            mode,
            best_index: judgment.best(),
            metrics: judgment.metrics(),
            chunks,
        };

        for _ in 0..MAX_TIMESTAMP_ATTEMPTS {
            match self
                .store
                .insert_run(&run)
                .await
                .map_err(RecordError::Storage)?
            {
                Some(id) => {
                    run.id = Some(id);
                    info!(
                        run_id = id,
                        mode = %run.mode,
                        hit_rate = run.metrics.hit_rate,
                        mrr = run.metrics.mrr,
                        precision_at_k = run.metrics.precision_at_k,
                        "Recorded evaluation run"
                    );
                    return Ok(run);
                }
                None => {
                    debug!("Timestamp {} taken, retrying", run.timestamp_key());
                    run.timestamp += Duration::microseconds(1);
                }
            }
        }

        Err(RecordError::Storage(anyhow::anyhow!(
            "no free run timestamp after {MAX_TIMESTAMP_ATTEMPTS} attempts"
        )))
    }
}
