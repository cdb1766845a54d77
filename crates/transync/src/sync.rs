//! Sync engine: propagate record store changes into the search index.
//!
//! Records changed since the durable cursor are read in (version, id) order
//! and written in fixed-size batches. The cursor only moves past a batch once
//! that batch and every batch before it were fully confirmed, so a failed
//! batch is retried by the next run.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::SyncConfig;
use crate::coordinator::JobHandle;
use crate::db::{cursor_repo, Database};
use crate::error::{IndexError, StoreError};
use crate::index::{EmbeddingClient, SearchIndex};
use crate::model::{
    EntityKind, IndexDocument, ItemOutcome, JobState, OutcomeStatus, Record, RecordId,
};
use crate::retry::RetryPolicy;
use crate::store::RecordStore;

/// Result of writing one batch.
#[derive(Debug, Default)]
struct BatchReport {
    outcomes: Vec<ItemOutcome>,
    deleted: u64,
    degraded: bool,
}

impl BatchReport {
    fn fully_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.status == OutcomeStatus::Ok)
    }

    fn had_outage(&self) -> bool {
        self.outcomes.iter().any(|o| o.unavailable)
    }
}

/// One sync run for one entity kind.
pub struct SyncRun {
    handle: Arc<JobHandle>,
    entity_kind: EntityKind,
    db: Database,
    store: Arc<dyn RecordStore>,
    index: Arc<dyn SearchIndex>,
    embedder: Option<Arc<dyn EmbeddingClient>>,
    batch_size: usize,
    failure_limit: usize,
    retry: RetryPolicy,
}

impl SyncRun {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        handle: Arc<JobHandle>,
        entity_kind: EntityKind,
        db: Database,
        store: Arc<dyn RecordStore>,
        index: Arc<dyn SearchIndex>,
        embedder: Option<Arc<dyn EmbeddingClient>>,
        config: &SyncConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            handle,
            entity_kind,
            db,
            store,
            index,
            embedder: if config.embeddings { embedder } else { None },
            batch_size: config.batch_size.max(1),
            failure_limit: config.consecutive_failure_limit.max(1),
            retry,
        }
    }

    /// Runs to a terminal state and returns it.
    pub async fn run(self) -> JobState {
        let span = info_span!("sync",
            job_id = %self.handle.id(),
            entity_kind = %self.entity_kind,
        );
        self.execute().instrument(span).await
    }

    async fn execute(&self) -> JobState {
        if !self
            .handle
            .start(format!("Reading sync cursor for {}", self.entity_kind))
        {
            return self.handle.snapshot().state;
        }

        let cursor = match cursor_repo::get(&self.db, self.entity_kind.as_str()) {
            Ok(cursor) => cursor,
            Err(e) => {
                return self.settle(JobState::Failed, format!("Failed to read cursor: {}", e))
            }
        };

        let records = match self.changed_since(cursor).await {
            Ok(records) => records,
            Err(e) => {
                return self.settle(
                    JobState::Failed,
                    format!("Failed to query changed records: {}", e),
                )
            }
        };

        let batch_count = records.len().div_ceil(self.batch_size);
        self.handle.set_total(
            records.len() as u64,
            format!(
                "{} changed records since marker {} in {} batches",
                records.len(),
                cursor,
                batch_count
            ),
        );
        info!(
            cursor,
            records = records.len(),
            batches = batch_count,
            "Starting sync"
        );

        let mut contiguous = true;
        let mut committed = cursor;
        let mut consecutive_outages = 0usize;
        let mut outage_batches = 0usize;
        let mut attempted_batches = 0usize;
        let mut halted = false;

        for (number, batch) in records.chunks(self.batch_size).enumerate() {
            if self.handle.is_cancel_requested() {
                break;
            }

            let span = info_span!("sync_batch", batch = number + 1, size = batch.len());
            let report = self.sync_batch(batch).instrument(span).await;
            attempted_batches += 1;

            let succeeded = report.fully_succeeded();
            let outage = report.had_outage();
            self.handle
                .record_batch(report.outcomes, report.deleted, report.degraded);

            if succeeded && contiguous {
                let marker = batch.iter().map(|r| r.version).max().unwrap_or(committed);
                match cursor_repo::advance(&self.db, self.entity_kind.as_str(), marker) {
                    Ok(stored) => {
                        committed = stored;
                        debug!(marker = stored, "Advanced sync cursor");
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to persist sync cursor");
                        contiguous = false;
                    }
                }
            } else if !succeeded {
                contiguous = false;
            }

            if outage {
                outage_batches += 1;
                consecutive_outages += 1;
                if consecutive_outages >= self.failure_limit {
                    halted = true;
                    break;
                }
            } else {
                consecutive_outages = 0;
            }
        }

        let counters = self.handle.snapshot().counters;

        if self.handle.is_cancel_requested() {
            return self.settle(
                JobState::Cancelled,
                format!(
                    "Cancelled after {} of {} records, cursor at {}",
                    counters.processed, counters.total, committed
                ),
            );
        }

        if halted {
            return self.settle(
                JobState::Failed,
                format!(
                    "Stopped after {} consecutive index outages, cursor at {}",
                    consecutive_outages, committed
                ),
            );
        }

        if attempted_batches > 0 && outage_batches == attempted_batches {
            return self.settle(
                JobState::Failed,
                format!("Search index was unavailable for every batch, cursor at {}", committed),
            );
        }

        self.settle(
            JobState::Succeeded,
            format!(
                "Synced {} records: {} ok, {} failed, {} deleted, cursor at {}",
                counters.processed, counters.succeeded, counters.failed, counters.deleted, committed
            ),
        )
    }

    fn settle(&self, state: JobState, message: String) -> JobState {
        info!(%state, "{}", message);
        self.handle
            .finish(state, message)
            .unwrap_or_else(|| self.handle.snapshot().state)
    }

    async fn changed_since(&self, cursor: u64) -> Result<Vec<Record>, StoreError> {
        let mut attempt = 1;
        loop {
            match self
                .store
                .query_changed_since(&self.entity_kind, cursor)
                .await
            {
                Ok(records) => return Ok(records),
                Err(e) if e.is_retryable() && self.retry.has_attempts_left(attempt) => {
                    debug!(attempt, error = %e, "Retrying change query");
                    self.retry.wait(attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn sync_batch(&self, batch: &[Record]) -> BatchReport {
        let mut report = BatchReport::default();

        let (removed, live): (Vec<&Record>, Vec<&Record>) = batch.iter().partition(|r| r.deleted);

        let mut documents: Vec<IndexDocument> =
            live.iter().map(|r| IndexDocument::from(*r)).collect();
        if !documents.is_empty() {
            report.degraded = !self.embed(&mut documents).await;
        }

        let mut failures = self.upsert_with_retry(documents).await;
        let delete_failure = if removed.is_empty() {
            None
        } else {
            let ids: Vec<RecordId> = removed.iter().map(|r| r.id).collect();
            self.delete_with_retry(&ids).await.err()
        };

        // Outcomes in change-feed order.
        for record in batch {
            let item = record.id.to_string();
            let failure = if record.deleted {
                delete_failure.clone()
            } else {
                failures.remove(&record.id)
            };
            match failure {
                None => {
                    if record.deleted {
                        report.deleted += 1;
                    }
                    report.outcomes.push(ItemOutcome::ok(item));
                }
                Some(err) if err.is_retryable() => {
                    report.outcomes.push(ItemOutcome::unavailable(item, err.to_string()))
                }
                Some(err) => report.outcomes.push(ItemOutcome::failed(item, err.to_string())),
            }
        }

        if report.fully_succeeded() {
            debug!(records = batch.len(), "Batch confirmed");
        } else {
            warn!(
                failed = report.outcomes.iter().filter(|o| o.status == OutcomeStatus::Failed).count(),
                "Batch not fully confirmed"
            );
        }
        report
    }

    /// Fills in vectors for documents lacking one. Returns false when the
    /// batch has to go out lexical-only.
    async fn embed(&self, documents: &mut [IndexDocument]) -> bool {
        let Some(embedder) = self.embedder.as_ref() else {
            return true;
        };

        let missing: Vec<usize> = documents
            .iter()
            .enumerate()
            .filter(|(_, d)| d.embedding.is_none())
            .map(|(i, _)| i)
            .collect();
        if missing.is_empty() {
            return true;
        }

        let texts = missing.iter().map(|&i| documents[i].text.clone()).collect();
        match embedder.request_embeddings(texts).await {
            Ok(vectors) if vectors.len() == missing.len() => {
                for (i, vector) in missing.into_iter().zip(vectors) {
                    documents[i].embedding = Some(vector);
                }
                true
            }
            Ok(vectors) => {
                warn!(
                    expected = missing.len(),
                    received = vectors.len(),
                    "Embedding count mismatch, indexing lexical-only"
                );
                false
            }
            Err(e) => {
                warn!(error = %e, "Embeddings unavailable, indexing lexical-only");
                false
            }
        }
    }

    /// Upserts documents, retrying the whole call on outages and the
    /// per-document subset that failed retryably. Returns what still failed.
    async fn upsert_with_retry(
        &self,
        documents: Vec<IndexDocument>,
    ) -> HashMap<RecordId, IndexError> {
        let mut failures = HashMap::new();
        let mut pending = documents;
        let mut attempt = 0;

        while !pending.is_empty() {
            if attempt > 0 {
                self.retry.wait(attempt).await;
            }
            attempt += 1;

            match self.index.upsert_batch(&pending).await {
                Ok(results) => {
                    let mut by_id: HashMap<RecordId, Option<IndexError>> =
                        results.into_iter().map(|r| (r.id, r.error)).collect();
                    let mut retry = Vec::new();
                    for doc in pending {
                        match by_id.remove(&doc.id) {
                            Some(None) => {
                                failures.remove(&doc.id);
                            }
                            Some(Some(err)) if err.is_retryable() => {
                                failures.insert(doc.id, err);
                                retry.push(doc);
                            }
                            Some(Some(err)) => {
                                failures.insert(doc.id, err);
                            }
                            None => {
                                failures.insert(
                                    doc.id,
                                    IndexError::Unavailable(format!(
                                        "no result returned for record {}",
                                        doc.id
                                    )),
                                );
                                retry.push(doc);
                            }
                        }
                    }
                    pending = retry;
                }
                Err(err) => {
                    for doc in &pending {
                        failures.insert(doc.id, err.clone());
                    }
                    if !err.is_retryable() {
                        break;
                    }
                }
            }

            if !self.retry.has_attempts_left(attempt) {
                break;
            }
            if !pending.is_empty() {
                debug!(attempt, remaining = pending.len(), "Retrying index upsert");
            }
        }

        failures
    }

    async fn delete_with_retry(&self, ids: &[RecordId]) -> Result<(), IndexError> {
        let mut attempt = 1;
        loop {
            match self.index.delete_batch(ids).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && self.retry.has_attempts_left(attempt) => {
                    debug!(attempt, error = %e, "Retrying index delete");
                    self.retry.wait(attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::ProgressBus;
    use crate::db::record_repo;
    use crate::index::{HashEmbedder, SqliteSearchIndex};
    use crate::model::{JobKind, NewRecord, RecordProjection, ResourceKey};
    use crate::store::SqliteRecordStore;

    fn new_record(key: &str, text: &str) -> NewRecord {
        NewRecord {
            entity_kind: "segment".into(),
            source_kind: "notes".into(),
            natural_key: key.to_string(),
            source_path: format!("/in/{}.txt", key),
            content_hash: format!("hash-{}", text),
            projection: RecordProjection {
                title: key.to_string(),
                text: text.to_string(),
                attribution: None,
                recorded_at: None,
            },
        }
    }

    fn run(db: &Database, batch_size: usize) -> (SyncRun, Arc<JobHandle>, SqliteSearchIndex) {
        let bus = Arc::new(ProgressBus::default());
        let handle = JobHandle::new(
            JobKind::Sync,
            ResourceKey::search_index(&"segment".into()),
            bus,
        );
        let index = SqliteSearchIndex::new(db.clone());
        let config = SyncConfig {
            batch_size,
            ..SyncConfig::default()
        };
        let run = SyncRun::new(
            Arc::clone(&handle),
            "segment".into(),
            db.clone(),
            Arc::new(SqliteRecordStore::new(db.clone())),
            Arc::new(index.clone()),
            Some(Arc::new(HashEmbedder::default())),
            &config,
            RetryPolicy::immediate(1),
        );
        (run, handle, index)
    }

    #[tokio::test]
    async fn test_sync_indexes_and_advances_cursor() {
        let db = Database::open_in_memory().unwrap();
        for i in 0..5 {
            record_repo::upsert(&db, &new_record(&format!("r{}", i), "council budget")).unwrap();
        }

        let (sync, handle, index) = run(&db, 2);
        assert_eq!(sync.run().await, JobState::Succeeded);

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.counters.total, 5);
        assert_eq!(snapshot.counters.succeeded, 5);
        assert_eq!(index.count().unwrap(), 5);
        assert_eq!(cursor_repo::get(&db, "segment").unwrap(), 5);

        let stored = index.document(RecordId(1)).unwrap().unwrap();
        assert!(stored.embedding.is_some());
    }

    #[tokio::test]
    async fn test_nothing_changed_is_noop_success() {
        let db = Database::open_in_memory().unwrap();
        let (sync, handle, _) = run(&db, 10);
        assert_eq!(sync.run().await, JobState::Succeeded);
        assert_eq!(handle.snapshot().counters.total, 0);
        assert_eq!(cursor_repo::get(&db, "segment").unwrap(), 0);
    }

    #[tokio::test]
    async fn test_deletions_are_mirrored() {
        let db = Database::open_in_memory().unwrap();
        let a = record_repo::upsert(&db, &new_record("a", "alpha")).unwrap();
        record_repo::upsert(&db, &new_record("b", "beta")).unwrap();
        let (sync, _, index) = run(&db, 10);
        sync.run().await;
        assert_eq!(index.count().unwrap(), 2);

        record_repo::mark_deleted(&db, a.id).unwrap();
        let (sync, handle, index) = run(&db, 10);
        assert_eq!(sync.run().await, JobState::Succeeded);

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.counters.processed, 1);
        assert_eq!(snapshot.counters.deleted, 1);
        assert_eq!(index.count().unwrap(), 1);
        assert!(index.document(a.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejected_document_blocks_cursor() {
        let db = Database::open_in_memory().unwrap();
        record_repo::upsert(&db, &new_record("a", "alpha")).unwrap();
        record_repo::upsert(&db, &new_record("b", "   ")).unwrap();
        record_repo::upsert(&db, &new_record("c", "gamma")).unwrap();

        let (sync, handle, index) = run(&db, 1);
        assert_eq!(sync.run().await, JobState::Succeeded);

        let snapshot = handle.snapshot();
        assert_eq!(snapshot.counters.succeeded, 2);
        assert_eq!(snapshot.counters.failed, 1);
        assert_eq!(index.count().unwrap(), 2);
        // Batch 3 succeeded but batch 2 did not, so the cursor stays at batch 1.
        assert_eq!(cursor_repo::get(&db, "segment").unwrap(), 1);
    }
}
