//! Human judgments of retrieval results, and what they add up to.
//!
//! - [`recorder`]: turn one judged [`RetrievalResult`](crate::retrieval::RetrievalResult)
//!   into a persisted [`EvaluationRun`]
//! - [`metrics`]: per-mode summaries and run listings
//! - [`exchange`]: XML export of runs and corpus, deduplicating import
//!
//! Metrics for a run depend only on its relevance flags, its best index and
//! the number of chunks judged (K):
//!
//! - `hit_rate` is 1 when any chunk is relevant, else 0
//! - `mrr` is `1 / best_index`, or 0.0 when no best chunk was picked
//! - `precision_at_k` is `relevant / K`, or 0.0 when K is 0

pub mod exchange;
pub mod metrics;
pub mod recorder;

use crate::error::RecordError;
use crate::retrieval::RetrievalMode;
use crate::storage::ChunkId;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, SubsecRound, Utc};
use serde::Serialize;

pub use exchange::{ImportReport, RunExchange};
pub use metrics::{MetricsAggregator, MetricsSummary, ModeComparison, RunFilter, RunOrder};
pub use recorder::EvaluationRecorder;

/// Database ID for an evaluation run.
pub type RunId = i64;

/// Tolerance used when comparing stored metrics with recomputed ones.
pub const METRIC_TOLERANCE: f64 = 1e-6;

/// Current time at the resolution runs are keyed by.
pub fn now_timestamp() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Canonical text form of a run timestamp: RFC 3339, UTC, microseconds.
///
/// This string is the deduplication key, so every writer goes through here.
pub fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a run timestamp.
///
/// Accepts RFC 3339 with any offset, the legacy `YYYY-MM-DD HH:MM:SS[.ffffff]`
/// form (taken as UTC) and a bare `YYYY-MM-DD` (midnight UTC). The result is
/// truncated to microseconds.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc).trunc_subsecs(6));
    }
    for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc().trunc_subsecs(6));
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Quality figures derived from one judgment.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RunMetrics {
    pub hit_rate: u8,
    pub mrr: f64,
    pub precision_at_k: f64,
}

impl RunMetrics {
    /// Compute metrics from relevance flags and a 1-based best index.
    ///
    /// A best index outside `1..=flags.len()` contributes an MRR of 0.0;
    /// [`Judgment::validate`] rejects such judgments before they are recorded.
    pub fn compute(flags: &[bool], best_index: Option<usize>) -> Self {
        let k = flags.len();
        let relevant = flags.iter().filter(|flag| **flag).count();

        let mrr = match best_index {
            Some(best) if (1..=k).contains(&best) => 1.0 / best as f64,
            _ => 0.0,
        };
        let precision_at_k = if k == 0 {
            0.0
        } else {
            relevant as f64 / k as f64
        };

        Self {
            hit_rate: u8::from(relevant > 0),
            mrr,
            precision_at_k,
        }
    }

    pub fn approx_eq(&self, other: &RunMetrics) -> bool {
        self.hit_rate == other.hit_rate
            && (self.mrr - other.mrr).abs() <= METRIC_TOLERANCE
            && (self.precision_at_k - other.precision_at_k).abs() <= METRIC_TOLERANCE
    }
}

/// A reviewer's verdict on one retrieval result.
///
/// `relevant[i]` judges the chunk at 1-based position `i + 1`; `best` is the
/// 1-based position of the single most useful chunk, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Judgment {
    relevant: Vec<bool>,
    best: Option<usize>,
}

impl Judgment {
    pub fn new(relevant: Vec<bool>, best: Option<usize>) -> Self {
        Self { relevant, best }
    }

    /// Build a judgment for `k` chunks from the 1-based positions marked
    /// relevant.
    pub fn from_positions(
        k: usize,
        relevant_positions: &[usize],
        best: Option<usize>,
    ) -> Result<Self, RecordError> {
        let mut relevant = vec![false; k];
        for &position in relevant_positions {
            let slot = position
                .checked_sub(1)
                .and_then(|index| relevant.get_mut(index))
                .ok_or_else(|| {
                    RecordError::InconsistentJudgment(format!(
                        "relevant position {position} is outside 1..={k}"
                    ))
                })?;
            *slot = true;
        }
        let judgment = Self { relevant, best };
        judgment.validate(k)?;
        Ok(judgment)
    }

    /// Check the judgment against the number of chunks it covers.
    pub fn validate(&self, k: usize) -> Result<(), RecordError> {
        if self.relevant.len() != k {
            return Err(RecordError::InconsistentJudgment(format!(
                "{} relevance flags for {} retrieved chunks",
                self.relevant.len(),
                k
            )));
        }
        if let Some(best) = self.best {
            if !(1..=k).contains(&best) {
                return Err(RecordError::InconsistentJudgment(format!(
                    "best index {best} is outside 1..={k}"
                )));
            }
        }
        Ok(())
    }

    pub fn relevant(&self) -> &[bool] {
        &self.relevant
    }

    pub fn best(&self) -> Option<usize> {
        self.best
    }

    pub fn metrics(&self) -> RunMetrics {
        RunMetrics::compute(&self.relevant, self.best)
    }
}

/// Snapshot of one retrieved chunk inside a run.
///
/// Text and metadata are copied at recording time so a run stays readable
/// after the corpus changes.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunChunk {
    /// 1-based rank in the result
    pub position: usize,
    pub chunk_id: Option<ChunkId>,
    pub source: String,
    pub page: Option<u32>,
    pub text: String,
    pub score: f32,
    pub is_relevant: bool,
}

/// One judged retrieval. Never modified once stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationRun {
    pub id: Option<RunId>,
    pub timestamp: DateTime<Utc>,
    pub query: String,
    pub mode: RetrievalMode,
    pub best_index: Option<usize>,
    pub metrics: RunMetrics,
    pub chunks: Vec<RunChunk>,
}

impl EvaluationRun {
    /// Number of chunks judged.
    pub fn k(&self) -> usize {
        self.chunks.len()
    }

    pub fn relevant_flags(&self) -> Vec<bool> {
        self.chunks.iter().map(|chunk| chunk.is_relevant).collect()
    }

    /// 1-based positions judged relevant.
    pub fn relevant_positions(&self) -> Vec<usize> {
        self.chunks
            .iter()
            .filter(|chunk| chunk.is_relevant)
            .map(|chunk| chunk.position)
            .collect()
    }

    pub fn recomputed_metrics(&self) -> RunMetrics {
        RunMetrics::compute(&self.relevant_flags(), self.best_index)
    }

    pub fn timestamp_key(&self) -> String {
        format_timestamp(&self.timestamp)
    }
}
