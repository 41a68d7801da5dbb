use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::Semaphore;

use ocrgate_core::{FrameOutcome, InputKind, OcrError, RecognitionOptions, RecognitionResult};
use ocrgate_pipeline::Dispatcher;

use crate::config::Preset;

#[derive(Parser)]
#[command(name = "ocrgate", about = "OCR gateway: one accelerator, many recognition backends")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to a JSON config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Built-in config preset, used when no config file is given.
    #[arg(long, value_enum, default_value = "default", global = true)]
    pub preset: Preset,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` overrides it.
    #[arg(long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand)]
pub enum Command {
    /// Process a single file and print results.
    Process {
        /// Input file (image, animated image or PDF).
        #[arg(required = true)]
        input: PathBuf,
        /// Backend to run.
        #[arg(long, short, default_value = "mock")]
        backend: String,
        /// Input kind; guessed from extension and content when omitted.
        #[arg(long)]
        kind: Option<InputKind>,
        /// Output format.
        #[arg(long, default_value = "text")]
        format: OutputFormat,
        /// Zero-based pages to process, comma-separated.
        #[arg(long)]
        pages: Option<String>,
        /// Language hint passed to the backend.
        #[arg(long)]
        language: Option<String>,
        /// Request timeout override in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Submit every file in a directory concurrently.
    Batch {
        /// Input directory.
        #[arg(required = true)]
        input_dir: PathBuf,
        /// Output directory for results.
        #[arg(required = true)]
        output_dir: PathBuf,
        /// Backend to run.
        #[arg(long, short, default_value = "mock")]
        backend: String,
        /// Output format.
        #[arg(long, default_value = "json")]
        format: OutputFormat,
        /// Requests in flight at once.
        #[arg(long, default_value = "4")]
        concurrency: usize,
    },
    /// Print the health report, including every configured backend.
    Backends {
        /// Load every backend before reporting.
        #[arg(long)]
        warmup: bool,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
    Jsonl,
}

impl OutputFormat {
    fn extension(self) -> &'static str {
        match self {
            OutputFormat::Text => "txt",
            OutputFormat::Json => "json",
            OutputFormat::Jsonl => "jsonl",
        }
    }
}

/// Parse `--pages 0,2,5`.
pub fn parse_pages(spec: &str) -> anyhow::Result<Vec<u32>> {
    spec.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| p.parse().with_context(|| format!("invalid page number '{p}'")))
        .collect()
}

/// Kind from the file extension, falling back to magic bytes.
pub fn detect_kind(path: &Path, data: &[u8]) -> ocrgate_core::Result<InputKind> {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    InputKind::from_extension(&ext).or_else(|err| InputKind::sniff(data).ok_or(err))
}

/// Render a result in the requested format.
pub fn render(result: &RecognitionResult, format: OutputFormat) -> anyhow::Result<String> {
    let out = match format {
        OutputFormat::Text => {
            let mut out = String::new();
            for frame in &result.frames {
                if result.frames_total > 1 {
                    out.push_str(&format!("--- Page {} ---\n", frame.page_index + 1));
                }
                match &frame.outcome {
                    FrameOutcome::Text { text } => out.push_str(text),
                    FrameOutcome::Failed { reason } => {
                        out.push_str(&format!("[failed: {reason}]"))
                    }
                }
                out.push('\n');
            }
            out
        }
        OutputFormat::Json => serde_json::to_string_pretty(result)? + "\n",
        OutputFormat::Jsonl => {
            let mut out = String::new();
            for frame in &result.frames {
                out.push_str(&serde_json::to_string(frame)?);
                out.push('\n');
            }
            out
        }
    };
    Ok(out)
}

/// Process a single file and print it to stdout.
pub async fn process_file(
    dispatcher: &Dispatcher,
    path: &Path,
    backend: &str,
    kind: Option<InputKind>,
    format: OutputFormat,
    options: RecognitionOptions,
) -> anyhow::Result<()> {
    let data = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let kind = match kind {
        Some(kind) => kind,
        None => detect_kind(path, &data)?,
    };

    let result = dispatcher.handle(data, kind, backend, options).await?;
    print!("{}", render(&result, format)?);

    let timing = &result.timing;
    eprintln!(
        "\n[{:?} | {:.1}ms total | normalize:{:.1}ms queue:{:.1}ms execute:{:.1}ms | retries:{}]",
        result.status,
        timing.total_ms,
        timing.normalize_ms,
        timing.queue_ms,
        timing.execute_ms,
        result.total_retries()
    );
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub written: usize,
    pub rejected: usize,
    pub failed: usize,
}

/// Submit every file in `input_dir` with at most `concurrency` requests in
/// flight, writing one output file per input.
pub async fn run_batch(
    dispatcher: Arc<Dispatcher>,
    input_dir: &Path,
    output_dir: &Path,
    backend: &str,
    format: OutputFormat,
    concurrency: usize,
) -> anyhow::Result<BatchSummary> {
    std::fs::create_dir_all(output_dir)?;

    let mut inputs = Vec::new();
    for entry in std::fs::read_dir(input_dir)? {
        let path = entry?.path();
        if path.is_file() {
            inputs.push(path);
        }
    }
    inputs.sort();

    tracing::info!(
        input = %input_dir.display(),
        output = %output_dir.display(),
        files = inputs.len(),
        concurrency,
        "batch processing"
    );

    let permits = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = Vec::with_capacity(inputs.len());
    for path in inputs {
        let permit = permits.clone().acquire_owned().await?;
        let dispatcher = dispatcher.clone();
        let backend = backend.to_string();
        let output_dir = output_dir.to_path_buf();
        tasks.push(tokio::spawn(async move {
            let _permit = permit;
            let outcome = submit_one(&dispatcher, &path, &backend, format, &output_dir).await;
            (path, outcome)
        }));
    }

    let mut summary = BatchSummary::default();
    for task in tasks {
        let (path, outcome) = task.await?;
        match outcome {
            Ok(()) => summary.written += 1,
            Err(e) if matches!(e.downcast_ref::<OcrError>(), Some(OcrError::Overloaded { .. })) => {
                tracing::warn!(file = %path.display(), error = %e, "rejected: overloaded");
                summary.rejected += 1;
            }
            Err(e) => {
                tracing::error!(file = %path.display(), error = %e, "failed");
                summary.failed += 1;
            }
        }
    }

    tracing::info!(
        written = summary.written,
        rejected = summary.rejected,
        failed = summary.failed,
        "batch complete"
    );
    Ok(summary)
}

async fn submit_one(
    dispatcher: &Dispatcher,
    path: &Path,
    backend: &str,
    format: OutputFormat,
    output_dir: &Path,
) -> anyhow::Result<()> {
    let data = std::fs::read(path)?;
    let kind = detect_kind(path, &data)?;
    let result = dispatcher
        .handle(data, kind, backend, RecognitionOptions::default())
        .await?;

    let stem = path.file_stem().unwrap_or(path.as_os_str()).to_string_lossy();
    let target = output_dir.join(format!("{stem}.{}", format.extension()));
    std::fs::write(&target, render(&result, format)?)?;
    tracing::debug!(file = %path.display(), out = %target.display(), status = ?result.status, "written");
    Ok(())
}
