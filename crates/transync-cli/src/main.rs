//! transync: run ingestion and sync jobs from the command line.
//!
//! Progress events are written to stdout as JSON lines; logs go to stderr.
//! Ctrl-C requests cooperative cancellation of the running job.

use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use log::{info, warn};
use thiserror::Error;

use transync::{
    init_logging, load_settings, CoordinatorError, FeedItem, JobCoordinator, JobId, JobSnapshot,
    JobState, LogFormat, Settings, SqliteSearchIndex, TransyncError,
};

#[derive(Error, Debug)]
enum CliError {
    #[error(transparent)]
    Transync(#[from] TransyncError),

    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error("Failed to encode output: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to write output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to install Ctrl-C handler: {0}")]
    Signal(#[from] ctrlc::Error),
}

/// Ingest transcript files and keep the search index in sync.
#[derive(Parser, Debug)]
#[command(name = "transync", version, about)]
struct Cli {
    /// Path to the JSON settings file. Defaults apply when omitted.
    #[arg(long, env = "TRANSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format: compact or json.
    #[arg(long, env = "TRANSYNC_LOG_FORMAT", default_value = "compact")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest one configured source kind.
    Ingest { source_kind: String },
    /// Propagate record changes of an entity kind into the search index.
    Sync { entity_kind: String },
    /// Show a job snapshot from the archive.
    Status { job_id: String },
    /// Keyword search over the local index.
    Search {
        query: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
}

fn load(config: Option<&PathBuf>) -> Result<Settings, TransyncError> {
    match config {
        Some(path) => {
            info!("Loading settings from {}", path.display());
            Ok(load_settings(path)?)
        }
        None => Ok(Settings::default()),
    }
}

/// Streams a job's progress as JSON lines until it settles.
async fn follow(coordinator: &JobCoordinator, job_id: &JobId) -> Result<JobSnapshot, CliError> {
    let stdout = std::io::stdout();
    loop {
        let mut feed = coordinator.subscribe(job_id)?;
        let mut overflowed = false;
        while let Some(item) = feed.next().await {
            match item {
                FeedItem::Event(event) => {
                    let line = serde_json::to_string(&event)?;
                    writeln!(stdout.lock(), "{}", line)?;
                }
                FeedItem::Overflow { missed } => {
                    warn!("Progress feed fell {} events behind, resubscribing", missed);
                    overflowed = true;
                    break;
                }
            }
        }
        if !overflowed {
            return Ok(coordinator.status(job_id)?);
        }
    }
}

/// Follows a started job with Ctrl-C wired to cancellation.
async fn supervise(coordinator: JobCoordinator, job_id: JobId) -> Result<ExitCode, CliError> {
    let handler_coordinator = coordinator.clone();
    let handler_job = job_id.clone();
    ctrlc::set_handler(move || {
        if handler_coordinator.cancel(&handler_job) {
            eprintln!("Cancelling job {}...", handler_job);
        }
    })?;

    let snapshot = follow(&coordinator, &job_id).await?;
    info!("Job {} finished {}: {}", job_id, snapshot.state, snapshot.message);
    for failure in snapshot.failed_items() {
        warn!(
            "{}: {}",
            failure.item,
            failure.detail.as_deref().unwrap_or("failed")
        );
    }

    Ok(match snapshot.state {
        JobState::Succeeded => ExitCode::SUCCESS,
        JobState::Cancelled => ExitCode::from(130),
        _ => ExitCode::FAILURE,
    })
}

async fn run(cli: Cli) -> Result<ExitCode, CliError> {
    let settings = load(cli.config.as_ref())?;
    let coordinator = JobCoordinator::open(settings)?;

    match cli.command {
        Command::Ingest { source_kind } => {
            let job_id = coordinator.start_ingest(&source_kind.as_str().into())?;
            supervise(coordinator, job_id).await
        }
        Command::Sync { entity_kind } => {
            let job_id = coordinator.start_sync(&entity_kind.as_str().into())?;
            supervise(coordinator, job_id).await
        }
        Command::Status { job_id } => {
            let snapshot = coordinator.status(&JobId::from(job_id.as_str()))?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Search { query, limit } => {
            let index = SqliteSearchIndex::new(coordinator.database().clone());
            let hits = index
                .search_lexical(&query, limit)
                .map_err(TransyncError::from)?;
            let mut stdout = std::io::stdout().lock();
            for hit in hits {
                writeln!(stdout, "{}\t{:.3}\t{}", hit.id, hit.score, hit.title)?;
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log_format);

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}
