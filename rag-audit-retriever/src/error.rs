//! Error types at the crate's public boundaries.
//!
//! Storage code returns `anyhow::Result` internally; these enums are what the
//! retriever, recorder and exchange hand back to their callers, so a caller
//! can tell "the model is down" apart from "the database failed" apart from
//! "the judgment was nonsense".

use std::fmt;

/// Boxed error from a model provider.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Which half of the pipeline failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Query embedding and nearest-neighbour search
    Recall,
    /// Cross-encoder scoring of candidates
    Rerank,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Recall => write!(f, "recall"),
            Stage::Rerank => write!(f, "rerank"),
        }
    }
}

/// Failure of a `retrieve` call.
///
/// An empty corpus is not an error; it yields an empty result.
#[derive(Debug, thiserror::Error)]
pub enum RetrieveError {
    /// A model could not be loaded or did not answer. Not retried.
    #[error("{stage} stage unavailable: {source}")]
    UpstreamUnavailable {
        stage: Stage,
        #[source]
        source: BoxError,
    },

    /// The corpus store failed while looking up candidates.
    #[error("corpus storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

impl RetrieveError {
    pub fn upstream<E>(stage: Stage, source: E) -> Self
    where
        E: Into<BoxError>,
    {
        Self::UpstreamUnavailable {
            stage,
            source: source.into(),
        }
    }

    /// True when the failure is a model outage rather than a storage fault.
    pub fn is_upstream_unavailable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable { .. })
    }
}

/// Failure while recording a judgment session.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// Flags do not line up with the retrieved chunks, or the best index is
    /// out of range.
    #[error("inconsistent judgment: {0}")]
    InconsistentJudgment(String),

    #[error("query must not be empty")]
    EmptyQuery,

    #[error("run storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

/// Failure of an export or import as a whole.
///
/// Individual bad entries inside an import never produce this error; they are
/// counted as malformed in the import report.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// The document is not well-formed XML or has the wrong shape.
    #[error("invalid exchange document: {0}")]
    Document(String),

    #[error("unsupported schema version {found} (this build understands up to {supported})")]
    UnsupportedVersion { found: String, supported: u32 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}
