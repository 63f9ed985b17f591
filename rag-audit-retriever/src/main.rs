use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args as ClapArgs, Parser, Subcommand};
use rag_audit_embed::{FastEmbedProvider, FastEmbedReranker};
use rag_audit_retriever::{
    config::{AuditConfig, ConfigOverrides},
    error::{RetrieveError, Stage},
    evaluation::{
        EvaluationRecorder, EvaluationRun, Judgment, MetricsAggregator, MetricsSummary,
        RunExchange, RunFilter, RunOrder, exchange::export_corpus, format_timestamp,
        parse_timestamp,
    },
    retrieval::{
        CrossEncoderScorer, RetrievalMode, RetrievalResult, Retriever, VectorIndex,
        ingest::{ingest_chunks, read_chunks_file},
    },
    storage::{
        AuditIndex, Chunk, ChunkFilter, ChunkStore, RunStore, SqliteStore,
        audit_index::DATABASE_FILE_NAME,
    },
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Retrieve supporting chunks for a query and audit how good they were.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Base directory containing the .rag-audit.db database file
    #[arg(short, long, default_value = ".")]
    base_dir: PathBuf,

    /// Configuration file (defaults to <base-dir>/rag-audit.toml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Candidates fetched by the recall stage before reranking
    #[arg(long, global = true)]
    k_raw: Option<usize>,

    /// Chunks returned to the caller
    #[arg(long, global = true)]
    k_final: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize the audit database
    Init,
    /// Embed and store pre-chunked documents from a JSON file
    Ingest {
        /// JSON array of {source, page, content} objects
        file: PathBuf,
        /// Chunks embedded per model call
        #[arg(long, default_value_t = 32)]
        batch_size: usize,
    },
    /// Inspect corpus chunks
    Chunks {
        #[command(subcommand)]
        command: ChunkCommands,
    },
    /// Retrieve the chunks that best support a query
    Search {
        query: String,
        /// vector_only or reranked
        #[arg(short, long, default_value = "reranked")]
        mode: RetrievalMode,
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Retrieve for a query, judge the chunks and record the run
    Judge {
        query: String,
        /// vector_only or reranked
        #[arg(short, long, default_value = "reranked")]
        mode: RetrievalMode,
        /// Relevant positions, 1-based and comma-separated (skips the prompt)
        #[arg(long, value_delimiter = ',')]
        relevant: Option<Vec<usize>>,
        /// Position of the single most useful chunk (skips the prompt)
        #[arg(long)]
        best: Option<usize>,
        /// Record without prompting; unspecified positions are not relevant
        #[arg(long)]
        no_prompt: bool,
    },
    /// Mean metrics per retrieval mode
    Summary {
        #[command(flatten)]
        filter: FilterArgs,
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// List recorded runs with their judgments
    Runs {
        #[command(flatten)]
        filter: FilterArgs,
        /// List oldest runs first
        #[arg(long)]
        oldest_first: bool,
        /// Limit number of results
        #[arg(short, long)]
        limit: Option<usize>,
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Write every recorded run to an XML document
    ExportRuns {
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Merge runs from an XML document, skipping timestamps already stored
    ImportRuns {
        input: PathBuf,
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Write every corpus chunk to an XML document
    ExportCorpus {
        /// Output file (stdout when omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show corpus and run statistics
    Stats {
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
}

#[derive(Subcommand, Debug)]
enum ChunkCommands {
    /// List chunks in the corpus
    List {
        /// Only chunks from this source document
        #[arg(long)]
        source: Option<String>,
        /// Limit number of results
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
        /// Output format
        #[arg(short, long, default_value = "summary")]
        format: OutputFormat,
    },
    /// Get a specific chunk by ID
    Get {
        /// Chunk ID
        id: i64,
        /// Output format
        #[arg(short, long, default_value = "full")]
        format: OutputFormat,
    },
}

#[derive(ClapArgs, Debug, Clone, Default)]
struct FilterArgs {
    /// Only runs in this mode
    #[arg(long)]
    mode: Option<RetrievalMode>,
    /// Only runs at or after this time (RFC 3339 or YYYY-MM-DD)
    #[arg(long, value_parser = parse_time)]
    since: Option<DateTime<Utc>>,
    /// Only runs at or before this time (RFC 3339 or YYYY-MM-DD)
    #[arg(long, value_parser = parse_time)]
    until: Option<DateTime<Utc>>,
    /// Only runs whose query contains this text
    #[arg(long)]
    query_contains: Option<String>,
}

impl From<FilterArgs> for RunFilter {
    fn from(args: FilterArgs) -> Self {
        RunFilter {
            mode: args.mode,
            since: args.since,
            until: args.until,
            query_contains: args.query_contains,
        }
    }
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, String> {
    parse_timestamp(s).ok_or_else(|| format!("Invalid timestamp: {s}"))
}

#[derive(Debug, Clone, PartialEq)]
enum OutputFormat {
    Summary,
    Full,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "summary" => Ok(OutputFormat::Summary),
            "full" => Ok(OutputFormat::Full),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid format: {s}")),
        }
    }
}

#[derive(Serialize)]
struct ChunkOutput {
    id: i64,
    source: String,
    page: Option<u32>,
    position: usize,
    content_hash: String,
    content: String,
    has_embedding: bool,
}

impl From<Chunk> for ChunkOutput {
    fn from(chunk: Chunk) -> Self {
        Self {
            id: chunk.id.unwrap_or(0),
            content_hash: hex::encode(chunk.content_hash),
            source: chunk.source,
            page: chunk.page,
            position: chunk.position,
            has_embedding: chunk.embedding.is_some(),
            content: chunk.content,
        }
    }
}

#[derive(Serialize)]
struct HitOutput {
    position: usize,
    score: f32,
    chunk: ChunkOutput,
}

#[derive(Serialize)]
struct StatsOutput {
    chunk_count: usize,
    embedded_chunk_count: usize,
    source_count: usize,
    run_count: usize,
    runs_by_mode: Vec<(RetrievalMode, usize)>,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        match e.downcast_ref::<RetrieveError>() {
            Some(retrieve) if retrieve.is_upstream_unavailable() => {
                eprintln!("Error: retrieval is temporarily unavailable: {retrieve}");
            }
            _ => eprintln!("Error: {e:#}"),
        }
        process::exit(1);
    }
}

async fn open_store(base_dir: &Path) -> anyhow::Result<Arc<SqliteStore>> {
    Ok(Arc::new(SqliteStore::new(AuditIndex::open(base_dir).await?)))
}

/// Load the models a mode needs. Load failures count as the upstream stage
/// being unavailable.
async fn build_retriever(
    base_dir: &Path,
    config: &AuditConfig,
    store: Arc<SqliteStore>,
    mode: RetrievalMode,
) -> Result<Retriever, RetrieveError> {
    let embedder = FastEmbedProvider::create(config.models.embed_config(base_dir))
        .await
        .map_err(|e| RetrieveError::upstream(Stage::Recall, e))?;
    let retriever = Retriever::new(
        config.retrieval,
        Arc::new(VectorIndex::new(store, Arc::new(embedder))),
    );

    if mode == RetrievalMode::VectorOnly {
        return Ok(retriever);
    }
    let reranker = FastEmbedReranker::create(config.models.rerank_config(base_dir))
        .await
        .map_err(|e| RetrieveError::upstream(Stage::Rerank, e))?;
    Ok(retriever.with_scorer(Arc::new(CrossEncoderScorer::new(Arc::new(reranker)))))
}

async fn run() -> anyhow::Result<()> {
    let args = Args::parse();
    let overrides = ConfigOverrides {
        k_raw: args.k_raw,
        k_final: args.k_final,
    };
    let config = AuditConfig::load(&args.base_dir, args.config.as_deref(), &overrides)?;

    match args.command {
        Commands::Init => {
            let _index = AuditIndex::open(&args.base_dir).await?;
            println!("Initialized audit database at {}", args.base_dir.display());
            println!(
                "Database location: {}",
                args.base_dir.join(DATABASE_FILE_NAME).display()
            );
            Ok(())
        }
        Commands::Ingest { file, batch_size } => {
            let chunks = read_chunks_file(&file).await?;
            let store = open_store(&args.base_dir).await?;
            let embedder = FastEmbedProvider::create(config.models.embed_config(&args.base_dir))
                .await
                .context("failed to load the embedding model")?;

            let report = ingest_chunks(store.as_ref(), &embedder, chunks, batch_size).await?;
            println!(
                "Ingested {} chunks from {} ({} new, {} embedded, {} empty skipped)",
                report.stored,
                file.display(),
                report.newly_added,
                report.embeddings_generated,
                report.skipped_empty
            );
            Ok(())
        }
        Commands::Chunks { command } => {
            let store = open_store(&args.base_dir).await?;
            match command {
                ChunkCommands::List {
                    source,
                    limit,
                    format,
                } => {
                    let filter = ChunkFilter {
                        source,
                        has_embedding: None,
                        limit: Some(limit),
                    };
                    let chunk_metadata = store.list_chunks(filter).await?;

                    match format {
                        OutputFormat::Json => {
                            println!("{}", serde_json::to_string_pretty(&chunk_metadata)?);
                        }
                        OutputFormat::Summary => {
                            println!("Found {} chunks:", chunk_metadata.len());
                            for metadata in chunk_metadata {
                                println!(
                                    "  ID: {} | Source: {} | Page: {} | Position: {} | Length: {} | Embedding: {}",
                                    metadata.id,
                                    metadata.source,
                                    metadata.page.map_or("-".to_string(), |p| p.to_string()),
                                    metadata.position,
                                    metadata.content_length,
                                    if metadata.has_embedding { "yes" } else { "no" }
                                );
                            }
                        }
                        OutputFormat::Full => {
                            for metadata in chunk_metadata {
                                if let Some(chunk) = store.get_chunk(metadata.id).await? {
                                    print_chunk(&ChunkOutput::from(chunk));
                                    println!("---");
                                }
                            }
                        }
                    }
                }
                ChunkCommands::Get { id, format } => match store.get_chunk(id).await? {
                    Some(chunk) => {
                        let output = ChunkOutput::from(chunk);
                        match format {
                            OutputFormat::Json => {
                                println!("{}", serde_json::to_string_pretty(&output)?);
                            }
                            OutputFormat::Summary => {
                                println!("Chunk ID: {}", output.id);
                                println!("Location: {}", location(&output.source, output.page));
                                println!(
                                    "Content preview: {}",
                                    output.content.chars().take(100).collect::<String>()
                                );
                            }
                            OutputFormat::Full => print_chunk(&output),
                        }
                    }
                    None => println!("Chunk with ID {id} not found"),
                },
            }
            Ok(())
        }
        Commands::Search {
            query,
            mode,
            format,
        } => {
            let store = open_store(&args.base_dir).await?;
            let retriever = build_retriever(&args.base_dir, &config, store, mode).await?;
            let result = retriever.retrieve(&query, mode).await?;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&hit_outputs(result))?);
                }
                OutputFormat::Summary => print_result(&result, false),
                OutputFormat::Full => print_result(&result, true),
            }
            Ok(())
        }
        Commands::Judge {
            query,
            mode,
            relevant,
            best,
            no_prompt,
        } => {
            let store = open_store(&args.base_dir).await?;
            let retriever = build_retriever(&args.base_dir, &config, store.clone(), mode).await?;
            let result = retriever.retrieve(&query, mode).await?;
            print_result(&result, true);

            let judgment = if no_prompt || relevant.is_some() || best.is_some() || result.is_empty()
            {
                Judgment::from_positions(result.len(), &relevant.unwrap_or_default(), best)?
            } else {
                prompt_judgment(result.len()).await?
            };

            let run = EvaluationRecorder::new(store)
                .record(&query, mode, &result, &judgment)
                .await?;
            println!(
                "Recorded run {} at {}: hit rate {} | MRR {:.3} | precision@{} {:.3}",
                run.id.unwrap_or(0),
                run.timestamp_key(),
                run.metrics.hit_rate,
                run.metrics.mrr,
                run.k(),
                run.metrics.precision_at_k
            );
            Ok(())
        }
        Commands::Summary { filter, format } => {
            let filter = RunFilter::from(filter);
            let store = open_store(&args.base_dir).await?;
            let comparison = MetricsAggregator::new(store).compare(&filter).await?;

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&comparison)?);
                }
                OutputFormat::Summary | OutputFormat::Full => {
                    println!("Evaluation summary ({})", filter.describe());
                    print_summary(&comparison.vector_only);
                    print_summary(&comparison.reranked);
                    if let (Some(hit), Some(mrr), Some(precision)) = (
                        comparison.hit_rate_delta,
                        comparison.mrr_delta,
                        comparison.precision_at_k_delta,
                    ) {
                        println!(
                            "  reranked - vector_only: hit rate {hit:+.3} | MRR {mrr:+.3} | precision@k {precision:+.3}"
                        );
                    }
                }
            }
            Ok(())
        }
        Commands::Runs {
            filter,
            oldest_first,
            limit,
            format,
        } => {
            let filter = RunFilter::from(filter);
            let order = if oldest_first {
                RunOrder::OldestFirst
            } else {
                RunOrder::NewestFirst
            };
            let store = open_store(&args.base_dir).await?;
            let mut runs = MetricsAggregator::new(store).list_runs(&filter, order).await?;
            if let Some(limit) = limit {
                runs.truncate(limit);
            }

            match format {
                OutputFormat::Json => {
                    println!("{}", serde_json::to_string_pretty(&runs)?);
                }
                OutputFormat::Summary | OutputFormat::Full => {
                    let count = |mode: RetrievalMode| runs.iter().filter(|r| r.mode == mode).count();
                    println!(
                        "Found {} runs (vector_only: {}, reranked: {})",
                        runs.len(),
                        count(RetrievalMode::VectorOnly),
                        count(RetrievalMode::Reranked)
                    );
                    for run in &runs {
                        print_run(run, format == OutputFormat::Full);
                    }
                }
            }
            Ok(())
        }
        Commands::ExportRuns { output } => {
            let store = open_store(&args.base_dir).await?;
            let exchange = RunExchange::new(store.clone());
            match output {
                Some(path) => {
                    exchange.export_runs_to(&path).await?;
                    println!("Exported {} runs to {}", store.count_runs().await?, path.display());
                }
                None => write_stdout(&exchange.export_runs().await?).await?,
            }
            Ok(())
        }
        Commands::ImportRuns { input, format } => {
            let store = open_store(&args.base_dir).await?;
            let report = RunExchange::new(store).import_runs_from(&input).await?;

            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
                OutputFormat::Summary | OutputFormat::Full => println!(
                    "Imported {}: {} added, {} skipped as duplicates, {} malformed",
                    input.display(),
                    report.added,
                    report.skipped_duplicate,
                    report.malformed
                ),
            }
            Ok(())
        }
        Commands::ExportCorpus { output } => {
            let store = open_store(&args.base_dir).await?;
            let xml = export_corpus(store.as_ref()).await?;
            match output {
                Some(path) => {
                    tokio::fs::write(&path, &xml)
                        .await
                        .with_context(|| format!("failed to write {}", path.display()))?;
                    println!("Exported corpus to {}", path.display());
                }
                None => write_stdout(&xml).await?,
            }
            Ok(())
        }
        Commands::Stats { format } => {
            let store = open_store(&args.base_dir).await?;
            let corpus = store.corpus_stats().await?;
            let summaries = MetricsAggregator::new(store.clone())
                .summarize(&RunFilter::default())
                .await?;

            let stats = StatsOutput {
                chunk_count: corpus.chunk_count,
                embedded_chunk_count: corpus.embedded_chunk_count,
                source_count: corpus.source_count,
                run_count: store.count_runs().await?,
                runs_by_mode: summaries
                    .values()
                    .map(|summary| (summary.mode, summary.run_count))
                    .collect(),
            };

            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
                OutputFormat::Summary | OutputFormat::Full => {
                    println!("Database Statistics:");
                    println!("  Total chunks: {}", stats.chunk_count);
                    println!("  Chunks with embeddings: {}", stats.embedded_chunk_count);
                    println!("  Sources: {}", stats.source_count);
                    println!("  Evaluation runs: {}", stats.run_count);
                    for (mode, count) in &stats.runs_by_mode {
                        println!("    {mode}: {count}");
                    }
                }
            }
            Ok(())
        }
    }
}

fn location(source: &str, page: Option<u32>) -> String {
    match page {
        Some(page) => format!("{source} p.{page}"),
        None => source.to_string(),
    }
}

fn print_chunk(output: &ChunkOutput) {
    println!("Chunk ID: {}", output.id);
    println!("Location: {}", location(&output.source, output.page));
    println!("Position: {}", output.position);
    println!("Content Hash: {}", output.content_hash);
    println!(
        "Has Embedding: {}",
        if output.has_embedding { "Yes" } else { "No" }
    );
    println!("Content:\n{}", output.content);
}

fn hit_outputs(result: RetrievalResult) -> Vec<HitOutput> {
    result
        .hits
        .into_iter()
        .enumerate()
        .map(|(index, hit)| HitOutput {
            position: index + 1,
            score: hit.score,
            chunk: ChunkOutput::from(hit.chunk),
        })
        .collect()
}

fn print_result(result: &RetrievalResult, full: bool) {
    if result.is_empty() {
        println!("No supporting chunks found ({}).", result.mode);
        return;
    }
    println!("Top {} chunks ({}):", result.len(), result.mode);
    for (index, hit) in result.iter().enumerate() {
        if full {
            println!(
                "\n[{}] score {:.4} | {}",
                index + 1,
                hit.score,
                hit.chunk.location()
            );
            println!("{}", hit.chunk.content);
        } else {
            println!(
                "  {}. [{:.4}] {} | {}",
                index + 1,
                hit.score,
                hit.chunk.location(),
                hit.chunk.content.chars().take(80).collect::<String>()
            );
        }
    }
}

fn print_summary(summary: &MetricsSummary) {
    match (
        summary.mean_hit_rate,
        summary.mean_mrr,
        summary.mean_precision_at_k,
    ) {
        (Some(hit), Some(mrr), Some(precision)) => println!(
            "  {}: {} runs | hit rate {:.3} | MRR {:.3} | precision@k {:.3}",
            summary.mode, summary.run_count, hit, mrr, precision
        ),
        _ => println!("  {}: no runs", summary.mode),
    }
}

fn print_run(run: &EvaluationRun, full: bool) {
    println!(
        "  #{} {} [{}] hit {} | MRR {:.3} | precision@{} {:.3} | {}",
        run.id.unwrap_or(0),
        format_timestamp(&run.timestamp),
        run.mode,
        run.metrics.hit_rate,
        run.metrics.mrr,
        run.k(),
        run.metrics.precision_at_k,
        run.query
    );
    if !full {
        return;
    }
    for chunk in &run.chunks {
        let best = if run.best_index == Some(chunk.position) {
            " (best)"
        } else {
            ""
        };
        println!(
            "      {}. [{}] {:.4} {}{} | {}",
            chunk.position,
            if chunk.is_relevant { "x" } else { " " },
            chunk.score,
            location(&chunk.source, chunk.page),
            best,
            chunk.text.chars().take(80).collect::<String>()
        );
    }
}

async fn write_stdout(text: &str) -> anyhow::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(text.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

/// Comma-separated 1-based positions; blank means none.
fn parse_positions(line: &str) -> Result<Vec<usize>, String> {
    line.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<usize>()
                .map_err(|_| format!("not a position: {part:?}"))
        })
        .collect()
}

async fn prompt_judgment(k: usize) -> anyhow::Result<Judgment> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("\nRelevant positions 1-{k} (comma-separated, blank for none): ");
        std::io::Write::flush(&mut std::io::stdout())?;
        let Some(line) = lines.next_line().await? else {
            anyhow::bail!("judging aborted: no input");
        };
        let relevant = match parse_positions(&line) {
            Ok(positions) => positions,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };

        print!("Best position (blank for none): ");
        std::io::Write::flush(&mut std::io::stdout())?;
        let Some(line) = lines.next_line().await? else {
            anyhow::bail!("judging aborted: no input");
        };
        let best = match parse_positions(&line).as_deref() {
            Ok([]) => None,
            Ok([best]) => Some(*best),
            _ => {
                println!("Enter a single position or leave blank");
                continue;
            }
        };

        match Judgment::from_positions(k, &relevant, best) {
            Ok(judgment) => return Ok(judgment),
            Err(e) => println!("{e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_positions() {
        assert_eq!(parse_positions("1, 3"), Ok(vec![1, 3]));
        assert_eq!(parse_positions("   "), Ok(vec![]));
        assert!(parse_positions("1, two").is_err());
    }

    #[test]
    fn test_cli_parses_judge() {
        let args = Args::try_parse_from([
            "rag-audit",
            "--base-dir",
            "/tmp/x",
            "judge",
            "how to pay",
            "--mode",
            "vector",
            "--relevant",
            "1,3",
            "--best",
            "1",
            "--k-final",
            "3",
        ])
        .unwrap();
        assert_eq!(args.k_final, Some(3));
        match args.command {
            Commands::Judge {
                mode,
                relevant,
                best,
                ..
            } => {
                assert_eq!(mode, RetrievalMode::VectorOnly);
                assert_eq!(relevant, Some(vec![1, 3]));
                assert_eq!(best, Some(1));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_filter_args_parse_dates() {
        let args = Args::try_parse_from([
            "rag-audit",
            "summary",
            "--since",
            "2024-05-01",
            "--mode",
            "reranked",
        ])
        .unwrap();
        let Commands::Summary { filter, .. } = args.command else {
            panic!("expected summary");
        };
        let filter = RunFilter::from(filter);
        assert_eq!(filter.mode, Some(RetrievalMode::Reranked));
        assert_eq!(
            filter.since.map(|t| format_timestamp(&t)),
            Some("2024-05-01T00:00:00.000000Z".to_string())
        );
        assert!(Args::try_parse_from(["rag-audit", "runs", "--until", "soon"]).is_err());
    }
}
