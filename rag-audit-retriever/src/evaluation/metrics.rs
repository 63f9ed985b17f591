//! Per-mode summaries of stored evaluation runs.

use super::{EvaluationRun, format_timestamp};
use crate::retrieval::RetrievalMode;
use crate::storage::{ModeAggregate, RunStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Which runs to include in a summary or listing. Empty matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunFilter {
    pub mode: Option<RetrievalMode>,
    /// Inclusive lower bound on the run timestamp
    pub since: Option<DateTime<Utc>>,
    /// Inclusive upper bound on the run timestamp
    pub until: Option<DateTime<Utc>>,
    /// Case-insensitive substring of the query
    pub query_contains: Option<String>,
}

impl RunFilter {
    pub fn for_mode(mode: RetrievalMode) -> Self {
        Self {
            mode: Some(mode),
            ..Self::default()
        }
    }

    pub fn matches(&self, run: &EvaluationRun) -> bool {
        self.mode.is_none_or(|mode| mode == run.mode)
            && self.since.is_none_or(|since| run.timestamp >= since)
            && self.until.is_none_or(|until| run.timestamp <= until)
            && self.query_contains.as_ref().is_none_or(|term| {
                run.query.to_lowercase().contains(&term.to_lowercase())
            })
    }

    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(mode) = self.mode {
            parts.push(format!("mode={mode}"));
        }
        if let Some(since) = &self.since {
            parts.push(format!("since={}", format_timestamp(since)));
        }
        if let Some(until) = &self.until {
            parts.push(format!("until={}", format_timestamp(until)));
        }
        if let Some(term) = &self.query_contains {
            parts.push(format!("query~{term:?}"));
        }
        if parts.is_empty() {
            "all runs".to_string()
        } else {
            parts.join(", ")
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunOrder {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Mean metrics for one retrieval mode.
///
/// Means are `None` when the group has no runs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub mode: RetrievalMode,
    pub run_count: usize,
    pub mean_hit_rate: Option<f64>,
    pub mean_mrr: Option<f64>,
    pub mean_precision_at_k: Option<f64>,
}

impl MetricsSummary {
    pub fn empty(mode: RetrievalMode) -> Self {
        Self {
            mode,
            run_count: 0,
            mean_hit_rate: None,
            mean_mrr: None,
            mean_precision_at_k: None,
        }
    }

    fn from_aggregate(aggregate: &ModeAggregate) -> Self {
        if aggregate.run_count == 0 {
            return Self::empty(aggregate.mode);
        }
        Self {
            mode: aggregate.mode,
            run_count: aggregate.run_count,
            mean_hit_rate: Some(aggregate.mean_hit_rate),
            mean_mrr: Some(aggregate.mean_mrr),
            mean_precision_at_k: Some(aggregate.mean_precision_at_k),
        }
    }
}

/// Reranked minus vector-only, per metric.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModeComparison {
    pub vector_only: MetricsSummary,
    pub reranked: MetricsSummary,
    pub hit_rate_delta: Option<f64>,
    pub mrr_delta: Option<f64>,
    pub precision_at_k_delta: Option<f64>,
}

impl ModeComparison {
    fn new(vector_only: MetricsSummary, reranked: MetricsSummary) -> Self {
        let delta = |a: Option<f64>, b: Option<f64>| Some(b? - a?);
        Self {
            hit_rate_delta: delta(vector_only.mean_hit_rate, reranked.mean_hit_rate),
            mrr_delta: delta(vector_only.mean_mrr, reranked.mean_mrr),
            precision_at_k_delta: delta(
                vector_only.mean_precision_at_k,
                reranked.mean_precision_at_k,
            ),
            vector_only,
            reranked,
        }
    }
}

/// Reads stored runs and reduces them to per-mode figures.
pub struct MetricsAggregator {
    store: Arc<dyn RunStore>,
}

impl MetricsAggregator {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Mean metrics per mode. Every mode is present, with a zero count when
    /// no run matches.
    pub async fn summarize(
        &self,
        filter: &RunFilter,
    ) -> anyhow::Result<BTreeMap<RetrievalMode, MetricsSummary>> {
        let aggregates = self.store.aggregate_runs(filter).await?;

        let mut summaries: BTreeMap<RetrievalMode, MetricsSummary> = RetrievalMode::ALL
            .into_iter()
            .map(|mode| (mode, MetricsSummary::empty(mode)))
            .collect();
        for aggregate in &aggregates {
            summaries.insert(aggregate.mode, MetricsSummary::from_aggregate(aggregate));
        }

        tracing::debug!(
            filter = %filter.describe(),
            groups = aggregates.len(),
            "Summarized evaluation runs"
        );
        Ok(summaries)
    }

    /// Side-by-side summary of both modes with reranked-minus-vector deltas.
    ///
    /// Deltas are `None` unless both modes have runs.
    pub async fn compare(&self, filter: &RunFilter) -> anyhow::Result<ModeComparison> {
        let mut summaries = self.summarize(filter).await?;
        let vector_only = summaries
            .remove(&RetrievalMode::VectorOnly)
            .unwrap_or_else(|| MetricsSummary::empty(RetrievalMode::VectorOnly));
        let reranked = summaries
            .remove(&RetrievalMode::Reranked)
            .unwrap_or_else(|| MetricsSummary::empty(RetrievalMode::Reranked));
        Ok(ModeComparison::new(vector_only, reranked))
    }

    /// Individual runs with their full judgment detail.
    pub async fn list_runs(
        &self,
        filter: &RunFilter,
        order: RunOrder,
    ) -> anyhow::Result<Vec<EvaluationRun>> {
        self.store.list_runs(filter, order).await
    }
}
