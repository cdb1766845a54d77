//! Ingestion job: discover one source's files, parse, validate and upsert them.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::stream::{FuturesUnordered, StreamExt};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{IngestConfig, SourceConfig};
use crate::coordinator::JobHandle;
use crate::error::{ParseError, StoreError};
use crate::model::{FileWrite, ItemOutcome, JobState, NewRecord, RawFile};
use crate::parser::Parser;
use crate::retry::RetryPolicy;
use crate::sanitize;
use crate::store::RecordStore;
use crate::worker::DirectoryScanner;

/// Outcome of one file plus the records it no longer produces.
struct FileReport {
    outcome: ItemOutcome,
    retired: u64,
}

impl FileReport {
    fn new(outcome: ItemOutcome) -> Self {
        Self {
            outcome,
            retired: 0,
        }
    }
}

/// One ingestion run for one source kind.
pub struct IngestJob {
    handle: Arc<JobHandle>,
    source: SourceConfig,
    parser: Arc<dyn Parser>,
    store: Arc<dyn RecordStore>,
    worker_count: usize,
    failure_limit: usize,
    retry: RetryPolicy,
}

impl IngestJob {
    pub fn new(
        handle: Arc<JobHandle>,
        source: SourceConfig,
        parser: Arc<dyn Parser>,
        store: Arc<dyn RecordStore>,
        config: &IngestConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            handle,
            source,
            parser,
            store,
            worker_count: config.worker_count.max(1),
            failure_limit: config.consecutive_failure_limit.max(1),
            retry,
        }
    }

    /// Runs to a terminal state and returns it.
    pub async fn run(self) -> JobState {
        let span = info_span!("ingest",
            job_id = %self.handle.id(),
            source = %self.source.kind,
        );
        self.execute().instrument(span).await
    }

    async fn execute(&self) -> JobState {
        if !self
            .handle
            .start(format!("Discovering files for {}", self.source.kind))
        {
            return self.handle.snapshot().state;
        }

        let files = match self.discover().await {
            Ok(files) => files,
            Err(message) => return self.settle(JobState::Failed, message),
        };
        self.handle.set_total(
            files.len() as u64,
            format!("Discovered {} files", files.len()),
        );
        info!(files = files.len(), "Starting ingestion");

        let mut pending = files.iter().cloned();
        let mut in_flight = FuturesUnordered::new();
        let mut halted = false;
        let mut consecutive_unavailable = 0usize;
        let mut unavailable_total = 0u64;

        loop {
            // Dispatch up to the pool size, checking the flags before each item.
            while in_flight.len() < self.worker_count
                && !halted
                && !self.handle.is_cancel_requested()
            {
                match pending.next() {
                    Some(path) => in_flight.push(self.process_file(path)),
                    None => break,
                }
            }

            let Some(FileReport { outcome, retired }) = in_flight.next().await else {
                break;
            };

            if outcome.unavailable {
                consecutive_unavailable += 1;
                unavailable_total += 1;
                if consecutive_unavailable >= self.failure_limit {
                    halted = true;
                }
            } else {
                consecutive_unavailable = 0;
            }
            self.handle.record_batch(vec![outcome], retired, false);
        }

        let counters = self.handle.snapshot().counters;

        if self.handle.is_cancel_requested() {
            return self.settle(
                JobState::Cancelled,
                format!(
                    "Cancelled after {} of {} files",
                    counters.processed, counters.total
                ),
            );
        }

        if halted {
            return self.settle(
                JobState::Failed,
                format!(
                    "Stopped after {} consecutive record store failures",
                    consecutive_unavailable
                ),
            );
        }

        if counters.processed > 0 && unavailable_total == counters.processed {
            return self.settle(
                JobState::Failed,
                "Record store was unavailable for every file".to_string(),
            );
        }

        if self.source.prune_missing {
            self.prune_missing(&files).await;
        }

        self.settle(
            JobState::Succeeded,
            format!(
                "Ingested {} files: {} ok, {} failed, {} skipped",
                counters.processed, counters.succeeded, counters.failed, counters.skipped
            ),
        )
    }

    fn settle(&self, state: JobState, message: String) -> JobState {
        info!(%state, "{}", message);
        self.handle
            .finish(state, message)
            .unwrap_or_else(|| self.handle.snapshot().state)
    }

    async fn discover(&self) -> Result<Vec<PathBuf>, String> {
        let scanner =
            DirectoryScanner::from_source(&self.source).map_err(|e| e.to_string())?;
        match tokio::task::spawn_blocking(move || scanner.scan()).await {
            Ok(Ok(files)) => Ok(files),
            Ok(Err(e)) => Err(format!("Discovery failed: {}", e)),
            Err(e) => Err(format!("Discovery task failed: {}", e)),
        }
    }

    async fn process_file(&self, path: PathBuf) -> FileReport {
        let span = info_span!("ingest_file", file = %sanitize::redact_path(&path));
        self.process_file_inner(path).instrument(span).await
    }

    async fn process_file_inner(&self, path: PathBuf) -> FileReport {
        let item = path.display().to_string();

        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                let err = ParseError::Read {
                    path: path.clone(),
                    message: e.to_string(),
                };
                warn!(error = %err, "Could not read file");
                return FileReport::new(ItemOutcome::failed(item, err.to_string()));
            }
        };

        let raw = RawFile::new(path.clone(), self.source.kind.clone(), bytes);
        let parser = Arc::clone(&self.parser);
        let documents = match tokio::task::spawn_blocking(move || parser.parse(&raw)).await {
            Ok(Ok(documents)) => documents,
            Ok(Err(e)) => {
                warn!(error = %e, "Parser rejected file");
                return FileReport::new(ItemOutcome::failed(item, e.to_string()));
            }
            Err(e) => {
                let outcome = ItemOutcome::failed(item, format!("Parser task failed: {}", e));
                return FileReport::new(outcome);
            }
        };

        for (ordinal, doc) in documents.iter().enumerate() {
            if let Err(e) = doc.validate(ordinal, &self.source.kind) {
                warn!(error = %e, "Invalid parser output");
                return FileReport::new(ItemOutcome::failed(item, e.to_string()));
            }
        }

        let records: Vec<NewRecord> = documents
            .iter()
            .enumerate()
            .map(|(ordinal, doc)| NewRecord::from_document(doc, &path, ordinal))
            .collect();
        let source_path = path.display().to_string();

        let write = match self.replace_with_retry(&source_path, &records).await {
            Ok(write) => write,
            Err(e) if e.is_retryable() => {
                warn!(error = %e, "Record store unavailable");
                return FileReport::new(ItemOutcome::unavailable(item, e.to_string()));
            }
            Err(e) => {
                warn!(error = %e, "Record store conflict");
                return FileReport::new(ItemOutcome::failed(item, e.to_string()));
            }
        };

        let retired = write.retired.len() as u64;
        if retired > 0 {
            debug!(retired, "Retired records no longer produced by file");
        }

        let outcome = if records.is_empty() {
            ItemOutcome::skipped(item, "parser produced no documents")
        } else if !write.changed() {
            debug!(documents = records.len(), "Content unchanged");
            ItemOutcome::skipped(item, "unchanged")
        } else {
            debug!(documents = records.len(), "Stored documents");
            ItemOutcome::ok(item)
        };
        FileReport { outcome, retired }
    }

    async fn replace_with_retry(
        &self,
        source_path: &str,
        records: &[NewRecord],
    ) -> Result<FileWrite, StoreError> {
        let mut attempt = 1;
        loop {
            match self
                .store
                .replace_file(&self.source.kind, source_path, records)
                .await
            {
                Ok(write) => return Ok(write),
                Err(e) if e.is_retryable() && self.retry.has_attempts_left(attempt) => {
                    debug!(attempt, error = %e, "Retrying file write");
                    self.retry.wait(attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Marks records whose source file was not discovered in this run deleted.
    async fn prune_missing(&self, discovered: &[PathBuf]) {
        let seen: HashSet<String> = discovered
            .iter()
            .map(|p| p.display().to_string())
            .collect();

        let live = match self.store.live_sources(&self.source.kind).await {
            Ok(live) => live,
            Err(e) => {
                warn!(error = %e, "Skipping prune, could not list live records");
                return;
            }
        };

        let mut pruned = 0u64;
        for (id, path) in live {
            if seen.contains(&path) {
                continue;
            }
            match self.store.mark_deleted(id).await {
                Ok(()) => pruned += 1,
                Err(e) => warn!(record = %id, error = %e, "Failed to prune record"),
            }
        }

        if pruned > 0 {
            info!(pruned, "Pruned records of missing files");
            self.handle.add_deleted(
                pruned,
                format!("Marked {} records from missing files deleted", pruned),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ProgressBus;
    use crate::config::ParserKind;
    use crate::db::{record_repo, Database};
    use crate::model::{JobKind, OutcomeStatus, ResourceKey, SourceKind};
    use crate::parser::PlainTextParser;
    use crate::store::SqliteRecordStore;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        db: Database,
        bus: Arc<ProgressBus>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: TempDir::new().unwrap(),
                db: Database::open_in_memory().unwrap(),
                bus: Arc::new(ProgressBus::default()),
            }
        }

        fn source(&self, prune_missing: bool) -> SourceConfig {
            SourceConfig {
                kind: SourceKind::from("notes"),
                entity_kind: "segment".into(),
                directory: self.dir.path().to_path_buf(),
                extensions: vec!["txt".to_string()],
                include: vec![],
                recursive: false,
                parser: ParserKind::Plain,
                prune_missing,
            }
        }

        fn job(&self, prune_missing: bool) -> (IngestJob, Arc<JobHandle>) {
            let source = self.source(prune_missing);
            let handle = JobHandle::new(
                JobKind::Ingest,
                ResourceKey::ingest(&source.kind),
                Arc::clone(&self.bus),
            );
            let parser = Arc::new(PlainTextParser::new(
                source.kind.clone(),
                source.entity_kind.clone(),
            ));
            let job = IngestJob::new(
                Arc::clone(&handle),
                source,
                parser,
                Arc::new(SqliteRecordStore::new(self.db.clone())),
                &IngestConfig::default(),
                RetryPolicy::immediate(2),
            );
            (job, handle)
        }

        fn write(&self, name: &str, content: &str) {
            std::fs::write(self.dir.path().join(name), content).unwrap();
        }
    }

    #[tokio::test]
    async fn test_ingest_then_rerun_skips_unchanged() {
        let fx = Fixture::new();
        fx.write("a.txt", "Opening\nCall to order.");
        fx.write("b.txt", "Minutes\nApproved.");
        fx.write("empty.txt", "   ");

        let (job, handle) = fx.job(false);
        assert_eq!(job.run().await, JobState::Succeeded);
        let first = handle.snapshot();
        assert_eq!(first.counters.total, 3);
        assert_eq!(first.counters.succeeded, 2);
        assert_eq!(first.counters.skipped, 1);
        assert_eq!(record_repo::count(&fx.db, "segment").unwrap(), 2);

        let (job, handle) = fx.job(false);
        assert_eq!(job.run().await, JobState::Succeeded);
        let second = handle.snapshot();
        assert_eq!(second.counters.skipped, 3);
        assert_eq!(record_repo::count(&fx.db, "segment").unwrap(), 2);
    }

    #[tokio::test]
    async fn test_missing_directory_fails_job() {
        let fx = Fixture::new();
        let (mut job, handle) = fx.job(false);
        job.source.directory = fx.dir.path().join("absent");

        assert_eq!(job.run().await, JobState::Failed);
        assert!(handle.snapshot().message.contains("Discovery failed"));
    }

    #[tokio::test]
    async fn test_prune_missing_marks_records_deleted() {
        let fx = Fixture::new();
        fx.write("keep.txt", "Keep\nbody");
        fx.write("gone.txt", "Gone\nbody");
        let (job, _) = fx.job(true);
        job.run().await;

        std::fs::remove_file(fx.dir.path().join("gone.txt")).unwrap();
        let (job, handle) = fx.job(true);
        assert_eq!(job.run().await, JobState::Succeeded);

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.counters.deleted, 1);
        assert_eq!(snapshot.outcomes.len(), 1);
        assert_eq!(snapshot.outcomes[0].status, OutcomeStatus::Skipped);
        let live = record_repo::live_sources(&fx.db, "notes").unwrap();
        assert_eq!(live.len(), 1);
        assert!(live[0].1.ends_with("keep.txt"));
    }
}
