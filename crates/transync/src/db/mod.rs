//! SQLite storage shared by every transync component.
//!
//! One file holds four groups of tables, each owned by one repository:
//! `records` (record store, [`record_repo`]), `sync_cursors` (durable sync
//! markers, [`cursor_repo`]), `jobs` (terminal job snapshots, [`job_repo`])
//! and `index_documents` with its `index_fts` mirror (local search index).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

pub mod cursor_repo;
pub mod error;
pub mod job_repo;
pub mod migrations;
pub mod record_repo;

pub use error::DatabaseError;

/// Shared handle to the transync database.
///
/// Clones share one connection. Record upserts, cursor advances and index
/// writes each run inside a single `with_conn` call, so a multi-row write
/// such as [`record_repo::replace_file`] is one transaction on that
/// connection.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens the database file, creating parent directories, and brings the
    /// schema up to date. WAL keeps status reads from blocking an ingest.
    pub fn open(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DatabaseError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        migrations::run_all(&conn)?;

        log::info!("Database opened at {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Private in-memory database with the full schema.
    pub fn open_in_memory() -> Result<Self, DatabaseError> {
        let conn = Connection::open_in_memory()?;
        migrations::run_all(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Runs `f` with exclusive access to the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, DatabaseError>
    where
        F: FnOnce(&Connection) -> Result<T, DatabaseError>,
    {
        let conn = self.conn.lock().map_err(|_| DatabaseError::LockPoisoned)?;
        f(&conn)
    }
}

/// `~/.transync/data`, or `None` without a home directory.
pub fn default_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".transync").join("data"))
}

/// Used when `database_path` is not configured.
pub fn default_database_path() -> Option<PathBuf> {
    default_data_dir().map(|d| d.join("transync.db"))
}
