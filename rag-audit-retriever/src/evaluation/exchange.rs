//! Portable XML documents for evaluation runs and the corpus.
//!
//! ## Run document
//!
//! ```xml
//! <evaluation_runs schema_version="1" exported_at="2024-05-01T09:00:00.000000Z" run_count="1">
//!   <run>
//!     <run_id>4</run_id>
//!     <timestamp>2024-05-01T08:59:12.123456Z</timestamp>
//!     <query><![CDATA[How do I renegotiate a debt?]]></query>
//!     <mode>reranked</mode>
//!     <best_index>1</best_index>          <!-- 0 when none -->
//!     <hit_rate>1</hit_rate>
//!     <mrr>1</mrr>
//!     <precision_at_k>0.6666666666666666</precision_at_k>
//!     <chunks>
//!       <chunk>
//!         <position>1</position>
//!         <chunk_id>17</chunk_id>
//!         <source><![CDATA[guide.pdf]]></source>
//!         <page>3</page>
//!         <score>4.25</score>
//!         <is_relevant>true</is_relevant>
//!         <text><![CDATA[Debts may be renegotiated ...]]></text>
//!       </chunk>
//!     </chunks>
//!   </run>
//! </evaluation_runs>
//! ```
//!
//! Import merges on `timestamp`: a run whose timestamp is already stored is
//! skipped, never overwritten. Entries that cannot be trusted are counted as
//! malformed and the rest of the batch continues. Documents without a
//! `schema_version` are read as the legacy layout (`validation_run`,
//! `search_type`, `*_eval` metrics, `rank`/`chunk_content`/`is_correct_eval`
//! chunks, space-separated timestamps).

use super::{
    EvaluationRun, METRIC_TOLERANCE, RunChunk, RunFilter, RunMetrics, RunOrder, format_timestamp,
    now_timestamp, parse_timestamp,
};
use crate::error::ExchangeError;
use crate::retrieval::RetrievalMode;
use crate::storage::{ChunkStore, RunStore};
use chrono::{DateTime, Utc};
use quick_xml::events::{BytesCData, BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Version written into exported documents and the newest one accepted.
pub const SCHEMA_VERSION: u32 = 1;

/// Outcome of one import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ImportReport {
    pub added: usize,
    pub skipped_duplicate: usize,
    pub malformed: usize,
}

impl ImportReport {
    pub fn total(&self) -> usize {
        self.added + self.skipped_duplicate + self.malformed
    }
}

// Export side

fn document_error(err: impl fmt::Display) -> ExchangeError {
    ExchangeError::Document(err.to_string())
}

/// Indented XML output. Free text is written as CDATA so that leading and
/// trailing whitespace survives a round trip.
struct XmlOutput {
    writer: Writer<Vec<u8>>,
}

impl XmlOutput {
    fn new() -> Result<Self, ExchangeError> {
        let mut output = Self {
            writer: Writer::new_with_indent(Vec::new(), b' ', 2),
        };
        output.event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        Ok(output)
    }

    fn event(&mut self, event: Event<'_>) -> Result<(), ExchangeError> {
        self.writer.write_event(event).map_err(document_error)
    }

    fn open(&mut self, name: &str, attributes: &[(&str, &str)]) -> Result<(), ExchangeError> {
        let mut start = BytesStart::new(name);
        for &attribute in attributes {
            start.push_attribute(attribute);
        }
        self.event(Event::Start(start))
    }

    fn close(&mut self, name: &str) -> Result<(), ExchangeError> {
        self.event(Event::End(BytesEnd::new(name)))
    }

    fn field(&mut self, name: &str, value: impl fmt::Display) -> Result<(), ExchangeError> {
        self.open(name, &[])?;
        self.event(Event::Text(BytesText::new(&value.to_string())))?;
        self.close(name)
    }

    fn verbatim(&mut self, name: &str, text: &str) -> Result<(), ExchangeError> {
        self.open(name, &[])?;
        // A section cannot contain "]]>", so it is split between two sections
        let mut rest = text;
        while let Some(at) = rest.find("]]>") {
            self.event(Event::CData(BytesCData::new(&rest[..at + 2])))?;
            rest = &rest[at + 2..];
        }
        self.event(Event::CData(BytesCData::new(rest)))?;
        self.close(name)
    }

    fn finish(self) -> Result<String, ExchangeError> {
        let mut xml = String::from_utf8(self.writer.into_inner()).map_err(document_error)?;
        xml.push('\n');
        Ok(xml)
    }
}

fn write_run(xml: &mut XmlOutput, run: &EvaluationRun) -> Result<(), ExchangeError> {
    xml.open("run", &[])?;
    if let Some(id) = run.id {
        xml.field("run_id", id)?;
    }
    xml.field("timestamp", run.timestamp_key())?;
    xml.verbatim("query", &run.query)?;
    xml.field("mode", run.mode.as_str())?;
    xml.field("best_index", run.best_index.unwrap_or(0))?;
    xml.field("hit_rate", run.metrics.hit_rate)?;
    xml.field("mrr", run.metrics.mrr)?;
    xml.field("precision_at_k", run.metrics.precision_at_k)?;

    xml.open("chunks", &[])?;
    for chunk in &run.chunks {
        xml.open("chunk", &[])?;
        xml.field("position", chunk.position)?;
        if let Some(id) = chunk.chunk_id {
            xml.field("chunk_id", id)?;
        }
        xml.verbatim("source", &chunk.source)?;
        if let Some(page) = chunk.page {
            xml.field("page", page)?;
        }
        xml.field("score", chunk.score)?;
        xml.field("is_relevant", chunk.is_relevant)?;
        xml.verbatim("text", &chunk.text)?;
        xml.close("chunk")?;
    }
    xml.close("chunks")?;
    xml.close("run")
}

/// Render runs as a run document.
pub fn render_runs(
    runs: &[EvaluationRun],
    exported_at: DateTime<Utc>,
) -> Result<String, ExchangeError> {
    let version = SCHEMA_VERSION.to_string();
    let exported_at = format_timestamp(&exported_at);
    let run_count = runs.len().to_string();

    let mut xml = XmlOutput::new()?;
    xml.open(
        "evaluation_runs",
        &[
            ("schema_version", version.as_str()),
            ("exported_at", exported_at.as_str()),
            ("run_count", run_count.as_str()),
        ],
    )?;
    for run in runs {
        write_run(&mut xml, run)?;
    }
    xml.close("evaluation_runs")?;
    xml.finish()
}

/// Export every corpus chunk with its text and metadata.
pub async fn export_corpus(store: &dyn ChunkStore) -> Result<String, ExchangeError> {
    let chunks = store.get_all_chunks().await.map_err(ExchangeError::Storage)?;

    let version = SCHEMA_VERSION.to_string();
    let exported_at = format_timestamp(&now_timestamp());
    let chunk_count = chunks.len().to_string();

    let mut xml = XmlOutput::new()?;
    xml.open(
        "corpus",
        &[
            ("schema_version", version.as_str()),
            ("exported_at", exported_at.as_str()),
            ("chunk_count", chunk_count.as_str()),
        ],
    )?;
    for chunk in &chunks {
        xml.open("chunk", &[])?;
        if let Some(id) = chunk.id {
            xml.field("chunk_id", id)?;
        }
        xml.verbatim("source", &chunk.source)?;
        if let Some(page) = chunk.page {
            xml.field("page", page)?;
        }
        xml.field("position", chunk.position)?;
        xml.field("content_hash", hex::encode(chunk.content_hash))?;
        xml.field("has_embedding", chunk.embedding.is_some())?;
        xml.verbatim("text", &chunk.content)?;
        xml.close("chunk")?;
    }
    xml.close("corpus")?;

    info!("Exported {} corpus chunks", chunks.len());
    xml.finish()
}

// Import side: the document is split into run entries first and each entry
// is deserialized and validated on its own, so one bad run cannot sink the
// batch.

/// The root's `schema_version` and every run entry as a standalone fragment.
#[derive(Debug)]
struct RunEntries {
    schema_version: Option<String>,
    entries: Vec<String>,
}

fn is_run_element(start: &BytesStart<'_>) -> bool {
    matches!(start.local_name().as_ref(), b"run" | b"validation_run")
}

fn schema_version_of(root: &BytesStart<'_>) -> Result<Option<String>, ExchangeError> {
    root.try_get_attribute("schema_version")
        .map_err(document_error)?
        .map(|attribute| {
            attribute
                .unescape_value()
                .map(|value| value.into_owned())
                .map_err(document_error)
        })
        .transpose()
}

fn split_entries(xml: &str) -> Result<RunEntries, ExchangeError> {
    let mut reader = Reader::from_str(xml);
    let mut schema_version = None;
    let mut entries = Vec::new();
    let mut in_root = false;

    loop {
        match reader.read_event().map_err(document_error)? {
            Event::Start(root) if !in_root => {
                schema_version = schema_version_of(&root)?;
                in_root = true;
            }
            Event::Empty(root) if !in_root => {
                return Ok(RunEntries {
                    schema_version: schema_version_of(&root)?,
                    entries,
                });
            }
            Event::Start(element) if is_run_element(&element) => {
                let body = reader.read_text(element.name()).map_err(document_error)?;
                entries.push(format!("<run>{body}</run>"));
            }
            Event::Empty(element) if is_run_element(&element) => {
                entries.push("<run/>".to_string());
            }
            Event::Start(other) => {
                debug!(
                    element = %String::from_utf8_lossy(other.name().as_ref()),
                    "Ignoring element between runs"
                );
                reader.read_to_end(other.name()).map_err(document_error)?;
            }
            Event::End(_) => {
                return Ok(RunEntries {
                    schema_version,
                    entries,
                });
            }
            Event::Eof if in_root => {
                return Err(ExchangeError::Document(
                    "document ends inside the root element".to_string(),
                ));
            }
            Event::Eof => {
                return Err(ExchangeError::Document("document has no root element".to_string()));
            }
            _ => {}
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRun {
    timestamp: Option<String>,
    query: Option<String>,
    #[serde(alias = "search_type")]
    mode: Option<String>,
    best_index: Option<String>,
    #[serde(alias = "hit_rate_eval")]
    hit_rate: Option<String>,
    #[serde(alias = "mrr_eval")]
    mrr: Option<String>,
    #[serde(alias = "precision_at_k_eval")]
    precision_at_k: Option<String>,
    #[serde(alias = "retrieved_chunks")]
    chunks: Option<RawChunkList>,
}

#[derive(Debug, Default, Deserialize)]
struct RawChunkList {
    #[serde(default, rename = "chunk")]
    items: Vec<RawChunk>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawChunk {
    #[serde(alias = "rank")]
    position: Option<String>,
    chunk_id: Option<String>,
    source: Option<String>,
    page: Option<String>,
    score: Option<String>,
    #[serde(alias = "is_correct_eval")]
    is_relevant: Option<String>,
    #[serde(alias = "chunk_content")]
    text: Option<String>,
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str, String> {
    present(value).ok_or_else(|| format!("missing {field}"))
}

fn number<T: FromStr>(value: &str, field: &str) -> Result<T, String> {
    value
        .parse()
        .map_err(|_| format!("{field} is not a number: {value:?}"))
}

fn finite(value: &str, field: &str) -> Result<f64, String> {
    let parsed: f64 = number(value, field)?;
    if parsed.is_finite() {
        Ok(parsed)
    } else {
        Err(format!("{field} is not finite: {value:?}"))
    }
}

/// Whole number in `0..=u32::MAX`, written either as an integer or as a
/// float like `3.0`.
fn whole(value: &str, field: &str) -> Result<u32, String> {
    if let Ok(parsed) = value.parse::<u64>() {
        return u32::try_from(parsed).map_err(|_| format!("{field} is out of range: {value:?}"));
    }
    let parsed = finite(value, field)?;
    if parsed >= 0.0 && parsed.fract() == 0.0 && parsed <= f64::from(u32::MAX) {
        Ok(parsed as u32)
    } else {
        Err(format!("{field} is not a whole number: {value:?}"))
    }
}

fn flag(value: &str, field: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "1.0" => Ok(true),
        "false" | "0" | "0.0" => Ok(false),
        _ => Err(format!("{field} is not a boolean: {value:?}")),
    }
}

fn page(value: &Option<String>) -> Result<Option<u32>, String> {
    match present(value) {
        None => Ok(None),
        Some(text) if text.eq_ignore_ascii_case("none") || text.eq_ignore_ascii_case("null") => {
            Ok(None)
        }
        Some(text) => whole(text, "page").map(Some),
    }
}

fn validate_chunk(raw: &RawChunk) -> Result<RunChunk, String> {
    let position = whole(required(&raw.position, "chunk position")?, "chunk position")? as usize;
    let chunk_id = present(&raw.chunk_id)
        .filter(|v| !v.eq_ignore_ascii_case("none"))
        .map(|v| number::<i64>(v, "chunk_id"))
        .transpose()?;
    let score = finite(required(&raw.score, "chunk score")?, "chunk score")? as f32;
    let is_relevant = flag(required(&raw.is_relevant, "is_relevant")?, "is_relevant")?;

    Ok(RunChunk {
        position,
        chunk_id,
        source: raw.source.clone().unwrap_or_default(),
        page: page(&raw.page)?,
        text: raw.text.clone().unwrap_or_default(),
        score,
        is_relevant,
    })
}

/// Derive the best index from an MRR value, for documents that predate
/// `best_index`.
fn best_from_mrr(mrr: f64, k: usize) -> Result<Option<usize>, String> {
    if mrr == 0.0 {
        return Ok(None);
    }
    let best = (1.0 / mrr).round();
    if best >= 1.0 && best <= k as f64 && (1.0 / best - mrr).abs() <= METRIC_TOLERANCE {
        Ok(Some(best as usize))
    } else {
        Err(format!("mrr {mrr} does not correspond to any position in 1..={k}"))
    }
}

fn validate_entry(raw: &RawRun) -> Result<EvaluationRun, String> {
    let timestamp_text = required(&raw.timestamp, "timestamp")?;
    let timestamp = parse_timestamp(timestamp_text)
        .ok_or_else(|| format!("unparseable timestamp {timestamp_text:?}"))?;
    let query = required(&raw.query, "query")?.to_string();
    let mode_text = required(&raw.mode, "mode")?;
    let mode = RetrievalMode::from_str(mode_text).map_err(|e| e.to_string())?;

    let hit_rate = whole(required(&raw.hit_rate, "hit_rate")?, "hit_rate")?;
    if hit_rate > 1 {
        return Err(format!("hit_rate must be 0 or 1, got {hit_rate}"));
    }
    let mrr = finite(required(&raw.mrr, "mrr")?, "mrr")?;
    let precision_at_k = finite(
        required(&raw.precision_at_k, "precision_at_k")?,
        "precision_at_k",
    )?;
    let metrics = RunMetrics {
        hit_rate: hit_rate as u8,
        mrr,
        precision_at_k,
    };

    let mut chunks = raw
        .chunks
        .as_ref()
        .map(|list| list.items.iter().map(validate_chunk).collect::<Result<Vec<_>, _>>())
        .transpose()?
        .unwrap_or_default();
    chunks.sort_by_key(|chunk| chunk.position);
    let k = chunks.len();
    if chunks
        .iter()
        .enumerate()
        .any(|(index, chunk)| chunk.position != index + 1)
    {
        return Err(format!("chunk positions are not exactly 1..={k}"));
    }

    let best_index = match present(&raw.best_index) {
        Some(text) => match whole(text, "best_index")? as usize {
            0 => None,
            best if best <= k => Some(best),
            best => return Err(format!("best_index {best} is outside 1..={k}")),
        },
        None => best_from_mrr(mrr, k)?,
    };

    let run = EvaluationRun {
        id: None,
        timestamp,
        query,
        mode,
        best_index,
        metrics,
        chunks,
    };

    let expected = run.recomputed_metrics();
    if !run.metrics.approx_eq(&expected) {
        return Err(format!(
            "stored metrics {:?} disagree with judgment ({:?})",
            run.metrics, expected
        ));
    }
    // Store the exact values so later exports are byte-stable
    Ok(EvaluationRun {
        metrics: expected,
        ..run
    })
}

fn check_schema_version(version: Option<&str>) -> Result<(), ExchangeError> {
    let Some(text) = version.map(str::trim) else {
        debug!("Document has no schema_version, reading legacy layout");
        return Ok(());
    };
    match text.parse::<u32>() {
        Ok(found) if found <= SCHEMA_VERSION => Ok(()),
        _ => Err(ExchangeError::UnsupportedVersion {
            found: text.to_string(),
            supported: SCHEMA_VERSION,
        }),
    }
}

/// Export and import of evaluation runs.
pub struct RunExchange {
    store: Arc<dyn RunStore>,
}

impl RunExchange {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    /// Every stored run, oldest first.
    pub async fn export_runs(&self) -> Result<String, ExchangeError> {
        let runs = self
            .store
            .list_runs(&RunFilter::default(), RunOrder::OldestFirst)
            .await
            .map_err(ExchangeError::Storage)?;
        let xml = render_runs(&runs, now_timestamp())?;
        info!("Exported {} evaluation runs", runs.len());
        Ok(xml)
    }

    pub async fn export_runs_to(&self, path: &Path) -> Result<usize, ExchangeError> {
        let xml = self.export_runs().await?;
        tokio::fs::write(path, &xml).await?;
        Ok(xml.len())
    }

    /// Merge a run document into the store.
    ///
    /// Fails only when the document as a whole is unreadable or from a newer
    /// schema. Each run is inserted atomically on its own, so a concurrent
    /// recorder never sees a half-imported run.
    pub async fn import_runs(&self, xml: &str) -> Result<ImportReport, ExchangeError> {
        let document = split_entries(xml)?;
        check_schema_version(document.schema_version.as_deref())?;

        let mut report = ImportReport::default();
        for (ordinal, entry) in document.entries.iter().enumerate() {
            let parsed = quick_xml::de::from_str::<RawRun>(entry)
                .map_err(|e| format!("unreadable entry: {e}"))
                .and_then(|raw| validate_entry(&raw));
            let run = match parsed {
                Ok(run) => run,
                Err(reason) => {
                    warn!(entry = ordinal + 1, %reason, "Skipping malformed run");
                    report.malformed += 1;
                    continue;
                }
            };

            match self
                .store
                .insert_run(&run)
                .await
                .map_err(ExchangeError::Storage)?
            {
                Some(_) => report.added += 1,
                None => {
                    debug!("Run at {} already stored", run.timestamp_key());
                    report.skipped_duplicate += 1;
                }
            }
        }

        info!(
            added = report.added,
            skipped_duplicate = report.skipped_duplicate,
            malformed = report.malformed,
            "Import complete"
        );
        Ok(report)
    }

    pub async fn import_runs_from(&self, path: &Path) -> Result<ImportReport, ExchangeError> {
        let xml = tokio::fs::read_to_string(path).await?;
        self.import_runs(&xml).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::Judgment;
    use crate::storage::{AuditIndex, Chunk, SqliteStore};
    use chrono::TimeZone;
    use tempfile::tempdir;
    use tracing_test::traced_test;

    fn run(second: u32, query: &str, mode: RetrievalMode, relevant: &[usize], best: Option<usize>) -> EvaluationRun {
        let judgment = Judgment::from_positions(3, relevant, best).unwrap();
        EvaluationRun {
            id: None,
            timestamp: Utc.with_ymd_and_hms(2024, 6, 2, 10, 30, second).unwrap(),
            query: query.to_string(),
            mode,
            best_index: best,
            metrics: judgment.metrics(),
            chunks: judgment
                .relevant()
                .iter()
                .enumerate()
                .map(|(i, flag)| RunChunk {
                    position: i + 1,
                    chunk_id: Some(i as i64 + 1),
                    source: "guide.pdf".to_string(),
                    page: (i > 0).then_some(i as u32),
                    text: format!("Passage {i} about <taxes> & \"debts\""),
                    score: 0.5 - i as f32 * 0.125,
                    is_relevant: *flag,
                })
                .collect(),
        }
    }

    async fn store() -> anyhow::Result<Arc<SqliteStore>> {
        let dir = tempdir()?;
        Ok(Arc::new(SqliteStore::new(AuditIndex::open_memory(dir.path()).await?)))
    }

    fn merge_keys(runs: &[EvaluationRun]) -> Vec<(String, String, RetrievalMode, u8, String, String)> {
        let mut keys: Vec<_> = runs
            .iter()
            .map(|r| {
                (
                    r.timestamp_key(),
                    r.query.clone(),
                    r.mode,
                    r.metrics.hit_rate,
                    format!("{:.9}", r.metrics.mrr),
                    format!("{:.9}", r.metrics.precision_at_k),
                )
            })
            .collect();
        keys.sort();
        keys
    }

    const GOOD_RUN: &str = r#"
    <run>
      <timestamp>2024-06-02T10:30:00.000000Z</timestamp>
      <query>How do I pay taxes?</query>
      <mode>reranked</mode>
      <best_index>1</best_index>
      <hit_rate>1</hit_rate>
      <mrr>1</mrr>
      <precision_at_k>1</precision_at_k>
      <chunks>
        <chunk><position>1</position><source>guide.pdf</source><score>3.5</score><is_relevant>true</is_relevant><text>Installments</text></chunk>
      </chunks>
    </run>"#;

    fn document(runs: &[&str]) -> String {
        format!(
            "<evaluation_runs schema_version=\"1\">{}</evaluation_runs>",
            runs.concat()
        )
    }

    #[tokio::test]
    async fn test_export_import_reproduces_runs() -> anyhow::Result<()> {
        let source = store().await?;
        let runs = vec![
            run(1, "pay taxes", RetrievalMode::VectorOnly, &[1, 3], Some(1)),
            run(2, "pay taxes", RetrievalMode::Reranked, &[3], Some(3)),
            run(3, "renegotiate debt", RetrievalMode::Reranked, &[], None),
        ];
        for r in &runs {
            source.insert_run(r).await?;
        }

        let xml = RunExchange::new(source.clone()).export_runs().await?;
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("schema_version=\"1\""));
        assert!(xml.contains("run_count=\"3\""));
        assert!(xml.contains("<text><![CDATA[Passage 0 about <taxes> & \"debts\"]]></text>"));

        let target = store().await?;
        let report = RunExchange::new(target.clone()).import_runs(&xml).await?;
        assert_eq!(
            report,
            ImportReport {
                added: 3,
                skipped_duplicate: 0,
                malformed: 0
            }
        );

        let imported = target.list_runs(&RunFilter::default(), RunOrder::OldestFirst).await?;
        assert_eq!(merge_keys(&imported), merge_keys(&runs));
        assert_eq!(imported[0].chunks, runs[0].chunks);
        assert_eq!(imported[2].best_index, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_import_is_idempotent() -> anyhow::Result<()> {
        let target = store().await?;
        let exchange = RunExchange::new(target.clone());
        let xml = render_runs(
            &[
                run(1, "a", RetrievalMode::VectorOnly, &[2], Some(2)),
                run(2, "b", RetrievalMode::Reranked, &[1], Some(1)),
            ],
            now_timestamp(),
        )?;

        let first = exchange.import_runs(&xml).await?;
        assert_eq!(first.added, 2);
        let second = exchange.import_runs(&xml).await?;
        assert_eq!(
            second,
            ImportReport {
                added: 0,
                skipped_duplicate: 2,
                malformed: 0
            }
        );
        assert_eq!(target.count_runs().await?, 2);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_entry_missing_query_is_malformed() -> anyhow::Result<()> {
        let target = store().await?;
        let missing_query = GOOD_RUN
            .replace("2024-06-02T10:30:00", "2024-06-02T10:31:00")
            .replace("<query>How do I pay taxes?</query>", "");
        let xml = document(&[GOOD_RUN, &missing_query]);

        let report = RunExchange::new(target.clone()).import_runs(&xml).await?;
        assert_eq!(
            report,
            ImportReport {
                added: 1,
                skipped_duplicate: 0,
                malformed: 1
            }
        );
        assert_eq!(report.total(), 2);
        assert!(logs_contain("Skipping malformed run"));
        assert!(logs_contain("missing query"));
        Ok(())
    }

    #[tokio::test]
    async fn test_malformed_entries_do_not_stop_batch() -> anyhow::Result<()> {
        let target = store().await?;
        let bad = [
            // non-numeric metric
            GOOD_RUN.replace("<mrr>1</mrr>", "<mrr>high</mrr>"),
            // chunk without a relevance flag
            GOOD_RUN.replace("<is_relevant>true</is_relevant>", ""),
            // best index beyond the judged chunks
            GOOD_RUN.replace("<best_index>1</best_index>", "<best_index>2</best_index>"),
            // metrics that the flags cannot produce
            GOOD_RUN.replace("<precision_at_k>1</precision_at_k>", "<precision_at_k>0.5</precision_at_k>"),
            // gap in chunk positions
            GOOD_RUN.replace("<position>1</position>", "<position>2</position>"),
            // unknown mode
            GOOD_RUN.replace("<mode>reranked</mode>", "<mode>hybrid</mode>"),
            // unparseable timestamp
            GOOD_RUN.replace("2024-06-02T10:30:00.000000Z", "last tuesday"),
            // best index that does not fit a position
            GOOD_RUN.replace("<best_index>1</best_index>", "<best_index>4294967297</best_index>"),
        ];
        let mut entries: Vec<&str> = bad.iter().map(String::as_str).collect();
        entries.push(GOOD_RUN);

        let report = RunExchange::new(target.clone())
            .import_runs(&document(&entries))
            .await?;
        assert_eq!(report.malformed, bad.len());
        assert_eq!(report.added, 1);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_entry_with_repeated_field_is_malformed() -> anyhow::Result<()> {
        let target = store().await?;
        let repeated = GOOD_RUN
            .replace("2024-06-02T10:30:00", "2024-06-02T10:32:00")
            .replace(
                "<query>How do I pay taxes?</query>",
                "<query>Q</query><query>R</query>",
            );

        let report = RunExchange::new(target.clone())
            .import_runs(&document(&[GOOD_RUN, &repeated]))
            .await?;
        assert_eq!(
            report,
            ImportReport {
                added: 1,
                skipped_duplicate: 0,
                malformed: 1
            }
        );
        assert!(logs_contain("unreadable entry"));
        Ok(())
    }

    #[tokio::test]
    async fn test_structural_damage_stays_inside_its_entry() -> anyhow::Result<()> {
        let target = store().await?;
        let nested = GOOD_RUN
            .replace("2024-06-02T10:30:00", "2024-06-02T10:33:00")
            .replace(
                "<query>How do I pay taxes?</query>",
                "<query><b>Q</b></query>",
            );
        let second = GOOD_RUN.replace("2024-06-02T10:30:00", "2024-06-02T10:34:00");
        let xml = document(&[
            GOOD_RUN,
            "<comment_el>exported by hand</comment_el>",
            &nested,
            "<run/>",
            &second,
        ]);

        let report = RunExchange::new(target.clone()).import_runs(&xml).await?;
        assert_eq!(
            report,
            ImportReport {
                added: 2,
                skipped_duplicate: 0,
                malformed: 2
            }
        );
        assert_eq!(target.count_runs().await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_chunk_text_keeps_surrounding_whitespace() -> anyhow::Result<()> {
        let mut original = run(4, "pay taxes", RetrievalMode::Reranked, &[2], Some(2));
        original.chunks[0].text = "  line one\n  two\n".to_string();
        original.chunks[1].text = "ends with ]]> marker ".to_string();
        original.chunks[2].text = String::new();
        original.chunks[2].source = " scanned.pdf".to_string();

        let xml = render_runs(std::slice::from_ref(&original), now_timestamp())?;
        let target = store().await?;
        let report = RunExchange::new(target.clone()).import_runs(&xml).await?;
        assert_eq!(report.added, 1, "{report:?}");

        let imported = target.list_runs(&RunFilter::default(), RunOrder::NewestFirst).await?;
        assert_eq!(imported[0].chunks, original.chunks);
        Ok(())
    }

    #[test]
    fn test_whole_numbers_share_one_bound() {
        assert_eq!(whole("3", "position"), Ok(3));
        assert_eq!(whole("3.0", "position"), Ok(3));
        assert_eq!(whole("4294967295", "position"), Ok(u32::MAX));
        assert!(whole("4294967296", "position").is_err());
        assert!(whole("4294967296.0", "position").is_err());
        assert!(whole("18446744073709551615", "position").is_err());
        assert!(whole("2.5", "position").is_err());
        assert!(whole("-1", "position").is_err());
    }

    #[tokio::test]
    async fn test_legacy_document() -> anyhow::Result<()> {
        let xml = r#"<?xml version="1.0" encoding="utf-8"?>
<dados_avaliacoes>
  <!-- export -->
  <validation_run>
    <id>12</id>
    <timestamp>2024-06-01 18:22:05</timestamp>
    <query>Posso parcelar dívidas?</query>
    <search_type>reranked</search_type>
    <hit_rate_eval>1</hit_rate_eval>
    <mrr_eval>0.5</mrr_eval>
    <precision_at_k_eval>0.5</precision_at_k_eval>
    <retrieved_chunks>
      <chunk>
        <id>1</id>
        <run_id>12</run_id>
        <rank>1</rank>
        <chunk_content>Primeiro trecho</chunk_content>
        <source>manual.pdf</source>
        <page>None</page>
        <score>0.91</score>
        <is_correct_eval>0</is_correct_eval>
      </chunk>
      <chunk>
        <id>2</id>
        <run_id>12</run_id>
        <rank>2</rank>
        <chunk_content>Segundo trecho</chunk_content>
        <source>manual.pdf</source>
        <page>4.0</page>
        <score>0.47</score>
        <is_correct_eval>1</is_correct_eval>
      </chunk>
    </retrieved_chunks>
  </validation_run>
</dados_avaliacoes>"#;

        let target = store().await?;
        let report = RunExchange::new(target.clone()).import_runs(xml).await?;
        assert_eq!(report.added, 1, "{report:?}");

        let stored = target.list_runs(&RunFilter::default(), RunOrder::NewestFirst).await?;
        let run = &stored[0];
        assert_eq!(run.timestamp_key(), "2024-06-01T18:22:05.000000Z");
        assert_eq!(run.best_index, Some(2));
        assert_eq!(run.chunks[1].page, Some(4));
        assert_eq!(run.chunks[0].page, None);
        assert_eq!(run.chunks[1].text, "Segundo trecho");
        assert_eq!(run.relevant_positions(), vec![2]);
        Ok(())
    }

    #[tokio::test]
    async fn test_document_level_errors() -> anyhow::Result<()> {
        let exchange = RunExchange::new(store().await?);

        let newer = GOOD_RUN.to_string();
        let xml = format!("<evaluation_runs schema_version=\"2\">{newer}</evaluation_runs>");
        assert!(matches!(
            exchange.import_runs(&xml).await,
            Err(ExchangeError::UnsupportedVersion { .. })
        ));

        for broken in ["<evaluation_runs><run>", "<evaluation_runs>", ""] {
            assert!(matches!(
                exchange.import_runs(broken).await,
                Err(ExchangeError::Document(_))
            ));
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_import_and_record() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let target = Arc::new(SqliteStore::new(AuditIndex::open(dir.path()).await?));
        let exchange = RunExchange::new(target.clone());
        let recorder = crate::evaluation::EvaluationRecorder::new(target.clone());

        let imported: Vec<EvaluationRun> = (0..30)
            .map(|s| run(s, "imported", RetrievalMode::VectorOnly, &[1], Some(1)))
            .collect();
        let xml = render_runs(&imported, now_timestamp())?;

        let result = crate::retrieval::RetrievalResult::empty(RetrievalMode::Reranked);
        let record_all = async {
            for _ in 0..30 {
                recorder
                    .record("live", RetrievalMode::Reranked, &result, &Judgment::new(Vec::new(), None))
                    .await?;
            }
            Ok::<_, crate::error::RecordError>(())
        };
        let (report, recorded) = tokio::join!(exchange.import_runs(&xml), record_all);
        recorded?;
        assert_eq!(report?.added, 30);

        let runs = target.list_runs(&RunFilter::default(), RunOrder::NewestFirst).await?;
        assert_eq!(runs.len(), 60);
        assert!(runs.iter().filter(|r| r.query == "imported").all(|r| r.chunks.len() == 3));
        Ok(())
    }

    #[tokio::test]
    async fn test_corpus_export() -> anyhow::Result<()> {
        let target = store().await?;
        target
            .insert_chunks(vec![
                Chunk::new("guide.pdf", Some(2), 0, "Fees & <penalties>"),
                Chunk::new("faq.pdf", None, 0, "Call us"),
            ])
            .await?;

        let xml = export_corpus(target.as_ref()).await?;
        assert!(xml.contains("<corpus "));
        assert!(xml.contains("chunk_count=\"2\""));
        assert!(xml.contains("<text><![CDATA[Fees & <penalties>]]></text>"));
        assert!(xml.contains("<page>2</page>"));
        assert!(xml.contains("<has_embedding>false</has_embedding>"));
        // faq.pdf sorts first
        assert!(xml.find("Call us") < xml.find("Fees"));
        Ok(())
    }

    #[test]
    fn test_best_from_mrr() {
        assert_eq!(best_from_mrr(0.0, 3), Ok(None));
        assert_eq!(best_from_mrr(1.0 / 3.0, 3), Ok(Some(3)));
        assert!(best_from_mrr(0.25, 3).is_err());
        assert!(best_from_mrr(0.4, 3).is_err());
    }
}
