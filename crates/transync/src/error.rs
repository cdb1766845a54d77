use std::path::PathBuf;
use thiserror::Error;

use crate::model::{JobId, ResourceKey};

#[derive(Error, Debug)]
pub enum TransyncError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Coordinator error: {0}")]
    Coordinator(#[from] CoordinatorError),

    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    #[error("Search index error: {0}")]
    Index(#[from] IndexError),

    #[error("Scan error: {0}")]
    Scan(#[from] ScanError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },
}

/// A raw file could not be turned into documents.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Failed to read '{path}': {message}")]
    Read { path: PathBuf, message: String },

    #[error("Malformed input '{path}': {message}")]
    Malformed { path: PathBuf, message: String },

    #[error("No parser registered for source kind '{0}'")]
    NoParser(String),
}

/// Parser output does not have the required document shape.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Unsupported document schema version {found} (expected {expected})")]
    SchemaVersion { found: u16, expected: u16 },

    #[error("Document {ordinal} has empty primary content")]
    EmptyBody { ordinal: usize },

    #[error("Document {ordinal} is missing a title")]
    MissingTitle { ordinal: usize },

    #[error("Document {ordinal} is missing an entity kind")]
    MissingEntityKind { ordinal: usize },

    #[error("Document {ordinal} is tagged '{found}' but was parsed as '{expected}'")]
    SourceMismatch {
        ordinal: usize,
        expected: String,
        found: String,
    },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Transient outage; callers retry with backoff.
    #[error("Record store unavailable: {0}")]
    Unavailable(String),

    /// Logical conflict such as an identity collision; never retried.
    #[error("Record store conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum IndexError {
    #[error("Search index unavailable: {0}")]
    Unavailable(String),

    #[error("Search index rejected document: {0}")]
    Rejected(String),
}

impl IndexError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, IndexError::Unavailable(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("Embeddings unavailable: {0}")]
    Unavailable(String),
}

/// Request-time errors returned synchronously by the coordinator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinatorError {
    #[error("Resource '{resource}' is busy with job {job_id}")]
    ResourceBusy { resource: ResourceKey, job_id: JobId },

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Unknown source kind: {0}")]
    UnknownSource(String),
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Input directory does not exist: {0}")]
    MissingDirectory(PathBuf),

    #[error("Directory scan failed for '{path}': {source}")]
    Walk {
        path: PathBuf,
        #[source]
        source: walkdir::Error,
    },

    #[error("Invalid include pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

pub type Result<T> = std::result::Result<T, TransyncError>;
