//! Sync scenarios: cursor durability, outages, degradation and deletions.

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use common::harness::{wait, ENTITY_KIND, SOURCE_KIND};
use common::{DownEmbedder, FlakyIndex, TestHarness};

use transync::db::record_repo;
use transync::{
    JobCoordinator, JobState, RecordId, SearchIndex, SqliteRecordStore, SqliteSearchIndex,
};

/// Ingests `count` files and returns the coordinator used.
async fn ingest(h: &TestHarness, count: usize) -> JobCoordinator {
    for i in 0..count {
        h.write_text(
            &format!("{:02}.txt", i),
            &format!("Segment {}\nMinutes of meeting {}.", i, i),
        );
    }
    let coord = h.coordinator(h.settings());
    let snapshot = wait(&coord, &coord.start_ingest(&SOURCE_KIND.into()).unwrap()).await;
    assert_eq!(snapshot.counters.succeeded, count as u64);
    coord
}

fn with_index(h: &TestHarness, index: Arc<dyn SearchIndex>) -> JobCoordinator {
    let mut settings = h.settings();
    settings.sync.max_attempts = 1;
    JobCoordinator::new(
        settings,
        h.db.clone(),
        Arc::new(SqliteRecordStore::new(h.db.clone())),
        index,
    )
}

#[tokio::test]
async fn test_outage_holds_cursor_and_rerun_resumes() {
    let h = TestHarness::new();
    ingest(&h, 6).await;

    // Batches of two: the second upsert call is the second batch.
    let index = Arc::new(FlakyIndex::new(SqliteSearchIndex::new(h.db.clone()), &[2]));
    let coord = with_index(&h, index.clone());

    let first = wait(&coord, &coord.start_sync(&ENTITY_KIND.into()).unwrap()).await;
    assert_eq!(first.state, JobState::Succeeded);
    assert_eq!(first.counters.total, 6);
    assert_eq!(first.counters.succeeded, 4);
    assert_eq!(first.counters.failed, 2);
    assert_eq!(first.failed_items().filter(|o| o.unavailable).count(), 2);
    // Marker of batch one only.
    assert_eq!(h.cursor(), 2);

    index.heal();
    let second = wait(&coord, &coord.start_sync(&ENTITY_KIND.into()).unwrap()).await;
    assert_eq!(second.state, JobState::Succeeded);
    assert_eq!(second.counters.total, 4);
    assert_eq!(second.counters.failed, 0);
    assert_eq!(h.cursor(), 6);
    assert_eq!(h.index().count().unwrap(), 6);
}

#[tokio::test]
async fn test_cursor_survives_restart() {
    let h = TestHarness::new();
    ingest(&h, 3).await;
    {
        let coord = h.coordinator(h.settings());
        let snapshot = wait(&coord, &coord.start_sync(&ENTITY_KIND.into()).unwrap()).await;
        assert_eq!(snapshot.counters.processed, 3);
    }

    let mut settings = h.settings();
    settings.sync.embeddings = false;
    let reopened = JobCoordinator::open(settings).unwrap();
    let snapshot = wait(
        &reopened,
        &reopened.start_sync(&ENTITY_KIND.into()).unwrap(),
    )
    .await;
    assert_eq!(snapshot.state, JobState::Succeeded);
    assert_eq!(snapshot.counters.total, 0);
}

#[tokio::test]
async fn test_dead_index_fails_sync() {
    let h = TestHarness::new();
    ingest(&h, 3).await;

    let index = Arc::new(FlakyIndex::down(SqliteSearchIndex::new(h.db.clone())));
    let coord = with_index(&h, index.clone());
    let snapshot = wait(&coord, &coord.start_sync(&ENTITY_KIND.into()).unwrap()).await;

    assert_eq!(snapshot.state, JobState::Failed);
    assert_eq!(snapshot.counters.failed, 3);
    assert_eq!(h.cursor(), 0);
    assert_eq!(index.calls(), 2);
}

#[tokio::test]
async fn test_consecutive_batch_outages_stop_sync() {
    let h = TestHarness::new();
    ingest(&h, 10).await;

    let index = Arc::new(FlakyIndex::new(
        SqliteSearchIndex::new(h.db.clone()),
        &[2, 3, 4],
    ));
    let mut settings = h.settings();
    settings.sync.max_attempts = 1;
    settings.sync.consecutive_failure_limit = 3;
    let coord = JobCoordinator::new(
        settings,
        h.db.clone(),
        Arc::new(SqliteRecordStore::new(h.db.clone())),
        index.clone(),
    );

    let snapshot = wait(&coord, &coord.start_sync(&ENTITY_KIND.into()).unwrap()).await;
    assert_eq!(snapshot.state, JobState::Failed);
    // Batch five is never attempted.
    assert_eq!(index.calls(), 4);
    assert_eq!(snapshot.counters.processed, 8);
    assert_eq!(snapshot.counters.total, 10);
    assert_eq!(h.cursor(), 2);
}

#[tokio::test]
async fn test_retry_absorbs_transient_outage() {
    let h = TestHarness::new();
    ingest(&h, 2).await;

    let index = Arc::new(FlakyIndex::new(SqliteSearchIndex::new(h.db.clone()), &[1]));
    let mut settings = h.settings();
    settings.sync.max_attempts = 3;
    let coord = JobCoordinator::new(
        settings,
        h.db.clone(),
        Arc::new(SqliteRecordStore::new(h.db.clone())),
        index.clone(),
    );

    let snapshot = wait(&coord, &coord.start_sync(&ENTITY_KIND.into()).unwrap()).await;
    assert_eq!(snapshot.state, JobState::Succeeded);
    assert_eq!(snapshot.counters.succeeded, 2);
    assert_eq!(index.calls(), 2);
    assert_eq!(h.cursor(), 2);
}

#[tokio::test]
async fn test_embedding_outage_degrades_batch() {
    let h = TestHarness::new();
    ingest(&h, 3).await;

    let embedder = Arc::new(DownEmbedder::new());
    let coord = h.coordinator(h.settings()).with_embedder(embedder.clone());
    let snapshot = wait(&coord, &coord.start_sync(&ENTITY_KIND.into()).unwrap()).await;

    assert_eq!(snapshot.state, JobState::Succeeded);
    assert_eq!(snapshot.counters.succeeded, 3);
    assert_eq!(snapshot.counters.degraded, 2);
    assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.cursor(), 3);

    let stored = h.index().document(RecordId(1)).unwrap().unwrap();
    assert!(stored.embedding.is_none());
    assert_eq!(h.index().search_lexical("meeting", 10).unwrap().len(), 3);
}

#[tokio::test]
async fn test_deletions_are_propagated() {
    let h = TestHarness::new();
    ingest(&h, 3).await;

    let mut settings = h.settings();
    settings.sources[0].prune_missing = true;
    let coord = h.coordinator(settings);
    wait(&coord, &coord.start_sync(&ENTITY_KIND.into()).unwrap()).await;
    assert_eq!(h.index().count().unwrap(), 3);

    h.remove("01.txt");
    let ingest = wait(&coord, &coord.start_ingest(&SOURCE_KIND.into()).unwrap()).await;
    assert_eq!(ingest.counters.deleted, 1);
    assert_eq!(ingest.counters.skipped, 2);

    let sync = wait(&coord, &coord.start_sync(&ENTITY_KIND.into()).unwrap()).await;
    assert_eq!(sync.state, JobState::Succeeded);
    assert_eq!(sync.counters.processed, 1);
    assert_eq!(sync.counters.deleted, 1);
    assert_eq!(h.index().count().unwrap(), 2);
    // 01.txt was ingested second.
    assert!(h.index().document(RecordId(2)).unwrap().is_none());

    let live = record_repo::live_sources(&h.db, SOURCE_KIND).unwrap();
    assert_eq!(live.len(), 2);
}
