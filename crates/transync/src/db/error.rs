//! Database error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::error::StoreError;

/// Errors from database operations.
#[derive(Error, Debug)]
pub enum DatabaseError {
    /// SQLite error from rusqlite.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error when creating directories or files.
    #[error("IO error for path '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A migration failed to apply.
    #[error("Migration failed at version {version}: {reason}")]
    Migration { version: u32, reason: String },

    /// A stored row could not be decoded.
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// A write collided with an existing identity.
    #[error("Identity conflict: {0}")]
    Conflict(String),

    /// The database lock was poisoned.
    #[error("Database lock poisoned")]
    LockPoisoned,
}

impl From<DatabaseError> for StoreError {
    fn from(err: DatabaseError) -> Self {
        let constraint = matches!(
            &err,
            DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(code, _))
                if code.code == rusqlite::ErrorCode::ConstraintViolation
        );
        match err {
            DatabaseError::Conflict(message) => StoreError::Conflict(message),
            other if constraint => StoreError::Conflict(other.to_string()),
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}
