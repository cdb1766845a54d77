//! Test harness for isolated coordinator runs.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use transync::config::{ParserKind, Settings, SourceConfig, SyncConfig};
use transync::{
    Database, FeedItem, HashEmbedder, JobCoordinator, JobId, JobSnapshot, ProgressEvent,
    SqliteRecordStore, SqliteSearchIndex,
};

pub const SOURCE_KIND: &str = "notes";
pub const ENTITY_KIND: &str = "segment";

pub struct TestHarness {
    temp_dir: TempDir,
    pub input_dir: PathBuf,
    pub db: Database,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let input_dir = temp_dir.path().join("input");
        std::fs::create_dir_all(&input_dir).expect("Failed to create input dir");
        let db = Database::open(&temp_dir.path().join("transync.db"))
            .expect("Failed to open database");

        Self {
            temp_dir,
            input_dir,
            db,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn database_path(&self) -> PathBuf {
        self.temp_dir.path().join("transync.db")
    }

    pub fn write_text(&self, filename: &str, content: &str) -> PathBuf {
        let path = self.input_dir.join(filename);
        std::fs::write(&path, content).expect("Failed to write input file");
        path
    }

    /// Writes a JSON transcript with one segment per entry of `segments`.
    pub fn write_transcript(&self, filename: &str, title: &str, segments: &[&str]) -> PathBuf {
        let segments: Vec<serde_json::Value> = segments
            .iter()
            .map(|text| serde_json::json!({ "speaker": "Clerk", "text": text }))
            .collect();
        let body = serde_json::json!({ "title": title, "segments": segments });
        self.write_text(filename, &body.to_string())
    }

    pub fn remove(&self, filename: &str) {
        std::fs::remove_file(self.input_dir.join(filename)).expect("Failed to remove input file");
    }

    pub fn source(&self) -> SourceConfig {
        SourceConfig {
            kind: SOURCE_KIND.into(),
            entity_kind: ENTITY_KIND.into(),
            directory: self.input_dir.clone(),
            extensions: vec!["txt".to_string()],
            include: Vec::new(),
            recursive: false,
            parser: ParserKind::Plain,
            prune_missing: false,
        }
    }

    /// Same source kind, reading JSON transcripts instead of text files.
    pub fn json_source(&self) -> SourceConfig {
        SourceConfig {
            extensions: vec!["json".to_string()],
            parser: ParserKind::Json,
            ..self.source()
        }
    }

    /// [`Self::settings`] with the JSON transcript source.
    pub fn json_settings(&self) -> Settings {
        Settings {
            sources: vec![self.json_source()],
            ..self.settings()
        }
    }

    /// Deterministic settings: one worker, no backoff, batches of two.
    pub fn settings(&self) -> Settings {
        let mut settings = Settings {
            database_path: Some(self.database_path()),
            sources: vec![self.source()],
            sync: SyncConfig {
                batch_size: 2,
                ..SyncConfig::default()
            },
            ..Settings::default()
        };
        settings.ingest.worker_count = 1;
        settings.ingest.max_attempts = 2;
        settings.retry.initial_backoff_ms = 0;
        settings.retry.max_backoff_ms = 0;
        settings
    }

    /// Coordinator over the harness database with the SQLite adapters.
    pub fn coordinator(&self, settings: Settings) -> JobCoordinator {
        JobCoordinator::new(
            settings,
            self.db.clone(),
            Arc::new(SqliteRecordStore::new(self.db.clone())),
            Arc::new(SqliteSearchIndex::new(self.db.clone())),
        )
        .with_embedder(Arc::new(HashEmbedder::default()))
    }

    pub fn index(&self) -> SqliteSearchIndex {
        SqliteSearchIndex::new(self.db.clone())
    }

    pub fn cursor(&self) -> u64 {
        transync::db::cursor_repo::get(&self.db, ENTITY_KIND).expect("Failed to read cursor")
    }
}

/// Waits for a job with a generous upper bound.
pub async fn wait(coordinator: &JobCoordinator, job_id: &JobId) -> JobSnapshot {
    tokio::time::timeout(Duration::from_secs(10), coordinator.wait(job_id))
        .await
        .expect("Job did not settle in time")
        .expect("Job not found")
}

/// Polls until `condition` holds.
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("Condition not reached in time");
}

/// Events of a drained feed, panicking on overflow.
pub fn events(items: Vec<FeedItem>) -> Vec<ProgressEvent> {
    items
        .into_iter()
        .map(|item| match item {
            FeedItem::Event(event) => event,
            FeedItem::Overflow { missed } => panic!("Feed overflowed by {}", missed),
        })
        .collect()
}
