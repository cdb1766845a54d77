use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{EntityKind, SourceKind};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub jobs: JobsConfig,
}

impl Settings {
    /// Configured database path, falling back to `~/.transync/data/transync.db`.
    pub fn resolved_database_path(&self) -> Option<PathBuf> {
        self.database_path
            .clone()
            .or_else(crate::db::default_database_path)
    }

    pub fn source(&self, kind: &SourceKind) -> Option<&SourceConfig> {
        self.sources.iter().find(|s| &s.kind == kind)
    }
}

/// Built-in parser a source is read with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParserKind {
    Plain,
    Json,
}

/// Discovery configuration for one source kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub kind: SourceKind,
    #[serde(default = "default_entity_kind")]
    pub entity_kind: EntityKind,
    pub directory: PathBuf,
    /// Lowercase extensions without the dot. Empty accepts any file.
    #[serde(default)]
    pub extensions: Vec<String>,
    /// Glob patterns relative to `directory`. Empty accepts any file.
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default = "default_parser")]
    pub parser: ParserKind,
    /// Mark records deleted when their source file is no longer discovered.
    #[serde(default)]
    pub prune_missing: bool,
}

fn default_entity_kind() -> EntityKind {
    EntityKind::from("segment")
}

fn default_parser() -> ParserKind {
    ParserKind::Plain
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default = "default_ingest_failure_limit")]
    pub consecutive_failure_limit: usize,
    /// Store write attempts per document, including the first.
    #[serde(default = "default_ingest_attempts")]
    pub max_attempts: u32,
}

fn default_worker_count() -> usize {
    num_cpus::get().clamp(1, 4)
}

fn default_ingest_failure_limit() -> usize {
    5
}

fn default_ingest_attempts() -> u32 {
    3
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            consecutive_failure_limit: default_ingest_failure_limit(),
            max_attempts: default_ingest_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_sync_failure_limit")]
    pub consecutive_failure_limit: usize,
    #[serde(default = "default_true")]
    pub embeddings: bool,
}

fn default_batch_size() -> usize {
    100
}

fn default_max_attempts() -> u32 {
    4
}

fn default_sync_failure_limit() -> usize {
    3
}

fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_attempts: default_max_attempts(),
            consecutive_failure_limit: default_sync_failure_limit(),
            embeddings: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_backoff_ms() -> u64 {
    200
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_subscriber_buffer() -> usize {
    256
}

impl JobsConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}
