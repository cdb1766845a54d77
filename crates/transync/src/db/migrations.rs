//! Database migration system.
//!
//! Tracks applied migrations in a `_migrations` table and applies
//! pending ones in order.

use rusqlite::Connection;

use super::error::DatabaseError;

/// A single migration definition.
struct Migration {
    version: u32,
    description: &'static str,
    sql: &'static str,
}

const CREATE_RECORDS: &str = "
CREATE TABLE IF NOT EXISTS records (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    natural_key   TEXT NOT NULL UNIQUE,
    entity_kind   TEXT NOT NULL,
    source_kind   TEXT NOT NULL,
    source_path   TEXT NOT NULL,
    content_hash  TEXT NOT NULL,
    title         TEXT NOT NULL,
    body          TEXT NOT NULL,
    attribution   TEXT,
    recorded_at   TEXT,
    version       INTEGER NOT NULL,
    deleted       INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_records_kind_version ON records (entity_kind, version, id);
CREATE INDEX IF NOT EXISTS idx_records_source ON records (source_kind, source_path);
";

const CREATE_SYNC_CURSORS: &str = "
CREATE TABLE IF NOT EXISTS sync_cursors (
    entity_kind  TEXT PRIMARY KEY,
    marker       INTEGER NOT NULL,
    updated_at   TEXT NOT NULL
);
";

const CREATE_JOBS: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id           TEXT PRIMARY KEY,
    kind         TEXT NOT NULL,
    resource     TEXT NOT NULL,
    state        TEXT NOT NULL,
    snapshot     TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    finished_at  TEXT
);
CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs (created_at);
";

const CREATE_INDEX_DOCUMENTS: &str = "
CREATE TABLE IF NOT EXISTS index_documents (
    record_id    INTEGER PRIMARY KEY,
    entity_kind  TEXT NOT NULL,
    version      INTEGER NOT NULL,
    title        TEXT NOT NULL,
    body         TEXT NOT NULL,
    attribution  TEXT,
    recorded_at  TEXT,
    embedding    BLOB,
    indexed_at   TEXT NOT NULL
);
CREATE VIRTUAL TABLE IF NOT EXISTS index_fts USING fts5 (title, body, attribution);
";

/// All migrations in order. Each is applied at most once.
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "create_records_table",
        sql: CREATE_RECORDS,
    },
    Migration {
        version: 2,
        description: "create_sync_cursors_table",
        sql: CREATE_SYNC_CURSORS,
    },
    Migration {
        version: 3,
        description: "create_jobs_table",
        sql: CREATE_JOBS,
    },
    Migration {
        version: 4,
        description: "create_index_tables",
        sql: CREATE_INDEX_DOCUMENTS,
    },
];

/// Runs all pending migrations on the given connection.
pub fn run_all(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )?;

    let current_version: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM _migrations",
        [],
        |r| r.get(0),
    )?;

    for migration in MIGRATIONS {
        if migration.version <= current_version {
            continue;
        }

        log::info!(
            "Running migration v{}: {}",
            migration.version,
            migration.description
        );

        conn.execute_batch(migration.sql)
            .map_err(|e| DatabaseError::Migration {
                version: migration.version,
                reason: e.to_string(),
            })?;

        conn.execute(
            "INSERT INTO _migrations (version, description) VALUES (?1, ?2)",
            rusqlite::params![migration.version, migration.description],
        )?;
    }

    Ok(())
}
