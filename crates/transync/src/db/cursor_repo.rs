//! Durable sync cursors, one per entity kind.

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use super::{Database, DatabaseError};

/// Returns the stored marker, or 0 when the kind has never been synced.
pub fn get(db: &Database, entity_kind: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let marker: Option<i64> = conn
            .query_row(
                "SELECT marker FROM sync_cursors WHERE entity_kind = ?1",
                params![entity_kind],
                |r| r.get(0),
            )
            .optional()?;
        Ok(marker.map(|m| m.max(0) as u64).unwrap_or(0))
    })
}

/// Moves the cursor forward to `marker`. Never moves it backwards.
///
/// Returns the stored value after the write.
pub fn advance(db: &Database, entity_kind: &str, marker: u64) -> Result<u64, DatabaseError> {
    let now = Utc::now().to_rfc3339();
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO sync_cursors (entity_kind, marker, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(entity_kind) DO UPDATE SET
                marker = MAX(marker, excluded.marker),
                updated_at = excluded.updated_at",
            params![entity_kind, marker as i64, now],
        )?;
        let stored: i64 = conn.query_row(
            "SELECT marker FROM sync_cursors WHERE entity_kind = ?1",
            params![entity_kind],
            |r| r.get(0),
        )?;
        Ok(stored as u64)
    })
}

/// Forgets the cursor so the next sync rescans from the beginning.
pub fn reset(db: &Database, entity_kind: &str) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "DELETE FROM sync_cursors WHERE entity_kind = ?1",
            params![entity_kind],
        )?;
        Ok(())
    })
}
