//! Record repository: the `records` table behind the SQLite record store.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, DatabaseError};
use crate::model::{FileWrite, NewRecord, Record, RecordId, RecordProjection, VersionedId};

fn next_version(conn: &Connection) -> Result<u64, DatabaseError> {
    let max: i64 = conn.query_row("SELECT COALESCE(MAX(version), 0) FROM records", [], |r| {
        r.get(0)
    })?;
    Ok(max as u64 + 1)
}

fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value.and_then(|s| match DateTime::parse_from_rfc3339(&s) {
        Ok(dt) => Some(dt.with_timezone(&Utc)),
        Err(e) => {
            log::warn!("record_repo: failed to parse timestamp '{}': {}", s, e);
            None
        }
    })
}

fn record_from_row(row: &Row<'_>) -> Result<Record, rusqlite::Error> {
    let version: i64 = row.get("version")?;
    let deleted: i64 = row.get("deleted")?;
    let entity_kind: String = row.get("entity_kind")?;
    Ok(Record {
        id: RecordId(row.get("id")?),
        entity_kind: entity_kind.into(),
        natural_key: row.get("natural_key")?,
        version: version as u64,
        deleted: deleted != 0,
        projection: RecordProjection {
            title: row.get("title")?,
            text: row.get("body")?,
            attribution: row.get("attribution")?,
            recorded_at: parse_timestamp(row.get("recorded_at")?),
        },
    })
}

/// Inserts or updates one record on an open connection.
///
/// Identical content leaves the row and its version untouched. A natural key
/// already owned by another entity or source kind is a conflict.
fn upsert_in(
    conn: &Connection,
    record: &NewRecord,
    now: &str,
) -> Result<VersionedId, DatabaseError> {
    let existing = conn
        .query_row(
            "SELECT id, entity_kind, source_kind, content_hash, version, deleted
             FROM records WHERE natural_key = ?1",
            params![record.natural_key],
            |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, i64>(4)?,
                    r.get::<_, i64>(5)?,
                ))
            },
        )
        .optional()?;

    let recorded_at = record.projection.recorded_at.map(|t| t.to_rfc3339());

    let Some((id, entity_kind, source_kind, hash, version, deleted)) = existing else {
        let version = next_version(conn)?;
        conn.execute(
            "INSERT INTO records (natural_key, entity_kind, source_kind, source_path,
             content_hash, title, body, attribution, recorded_at, version, deleted,
             created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11, ?11)",
            params![
                record.natural_key,
                record.entity_kind.as_str(),
                record.source_kind.as_str(),
                record.source_path,
                record.content_hash,
                record.projection.title,
                record.projection.text,
                record.projection.attribution,
                recorded_at,
                version as i64,
                now,
            ],
        )?;
        return Ok(VersionedId {
            id: RecordId(conn.last_insert_rowid()),
            version,
            changed: true,
        });
    };

    if entity_kind != record.entity_kind.as_str() || source_kind != record.source_kind.as_str() {
        return Err(DatabaseError::Conflict(format!(
            "natural key '{}' already belongs to {}/{}",
            record.natural_key, source_kind, entity_kind
        )));
    }

    if hash == record.content_hash && deleted == 0 {
        return Ok(VersionedId {
            id: RecordId(id),
            version: version as u64,
            changed: false,
        });
    }

    let version = next_version(conn)?;
    conn.execute(
        "UPDATE records SET content_hash = ?2, title = ?3, body = ?4,
         attribution = ?5, recorded_at = ?6, source_path = ?7,
         version = ?8, deleted = 0, updated_at = ?9
         WHERE id = ?1",
        params![
            id,
            record.content_hash,
            record.projection.title,
            record.projection.text,
            record.projection.attribution,
            recorded_at,
            record.source_path,
            version as i64,
            now,
        ],
    )?;
    Ok(VersionedId {
        id: RecordId(id),
        version,
        changed: true,
    })
}

/// Flags one live record deleted on an open connection.
fn mark_deleted_in(
    conn: &Connection,
    id: RecordId,
    now: &str,
) -> Result<Option<u64>, DatabaseError> {
    let deleted: Option<i64> = conn
        .query_row(
            "SELECT deleted FROM records WHERE id = ?1",
            params![id.0],
            |r| r.get(0),
        )
        .optional()?;
    if deleted != Some(0) {
        return Ok(None);
    }

    let version = next_version(conn)?;
    conn.execute(
        "UPDATE records SET deleted = 1, version = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.0, version as i64, now],
    )?;
    Ok(Some(version))
}

/// Inserts or updates a single record keyed by its natural key.
pub fn upsert(db: &Database, record: &NewRecord) -> Result<VersionedId, DatabaseError> {
    let now = Utc::now().to_rfc3339();
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let result = upsert_in(&tx, record, &now)?;
        tx.commit()?;
        Ok(result)
    })
}

/// Replaces the records of one source file in a single transaction.
///
/// Every record is upserted, then live records of the same source kind and
/// path whose natural key is not in `records` are marked deleted. Any error
/// rolls the whole file back.
pub fn replace_file(
    db: &Database,
    source_kind: &str,
    source_path: &str,
    records: &[NewRecord],
) -> Result<FileWrite, DatabaseError> {
    let now = Utc::now().to_rfc3339();
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;

        let mut written = Vec::with_capacity(records.len());
        for record in records {
            if record.source_kind.as_str() != source_kind || record.source_path != source_path {
                return Err(DatabaseError::Conflict(format!(
                    "record '{}' does not belong to {}:{}",
                    record.natural_key, source_kind, source_path
                )));
            }
            written.push(upsert_in(&tx, record, &now)?);
        }

        let keep: HashSet<&str> = records.iter().map(|r| r.natural_key.as_str()).collect();
        let stale = {
            let mut stmt = tx.prepare(
                "SELECT id, natural_key FROM records
                 WHERE source_kind = ?1 AND source_path = ?2 AND deleted = 0
                 ORDER BY id ASC",
            )?;
            let rows = stmt
                .query_map(params![source_kind, source_path], |r| {
                    Ok((RecordId(r.get(0)?), r.get::<_, String>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .filter(|(_, key)| !keep.contains(key.as_str()))
                .map(|(id, _)| id)
                .collect::<Vec<_>>()
        };

        let mut retired = Vec::with_capacity(stale.len());
        for id in stale {
            if mark_deleted_in(&tx, id, &now)?.is_some() {
                retired.push(id);
            }
        }

        tx.commit()?;
        Ok(FileWrite { written, retired })
    })
}

/// Records of `entity_kind` with a version above `marker`, ordered by
/// `(version, id)` so scans are deterministic and resumable.
pub fn changed_since(
    db: &Database,
    entity_kind: &str,
    marker: u64,
) -> Result<Vec<Record>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT * FROM records WHERE entity_kind = ?1 AND version > ?2
             ORDER BY version ASC, id ASC",
        )?;
        let rows = stmt
            .query_map(params![entity_kind, marker as i64], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Flags a record deleted and bumps its version so sync picks it up.
///
/// Returns `None` when the record does not exist or is already deleted.
pub fn mark_deleted(db: &Database, id: RecordId) -> Result<Option<u64>, DatabaseError> {
    let now = Utc::now().to_rfc3339();
    db.with_conn(|conn| {
        let tx = conn.unchecked_transaction()?;
        let result = mark_deleted_in(&tx, id, &now)?;
        tx.commit()?;
        Ok(result)
    })
}

/// Live records of a source kind with the path they were ingested from.
pub fn live_sources(
    db: &Database,
    source_kind: &str,
) -> Result<Vec<(RecordId, String)>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, source_path FROM records WHERE source_kind = ?1 AND deleted = 0
             ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![source_kind], |r| {
                Ok((RecordId(r.get(0)?), r.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    })
}

/// Number of records of an entity kind, including deleted ones.
pub fn count(db: &Database, entity_kind: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE entity_kind = ?1",
            params![entity_kind],
            |r| r.get(0),
        )?;
        Ok(n as u64)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StructuredDocument;
    use std::path::Path;

    fn new_record(path: &str, body: &str) -> NewRecord {
        segment(path, 0, body)
    }

    fn segment(path: &str, ordinal: usize, body: &str) -> NewRecord {
        let doc = StructuredDocument::new("plain".into(), "segment".into(), "T", body);
        NewRecord::from_document(&doc, Path::new(path), ordinal)
    }

    #[test]
    fn test_replace_file_retires_dropped_ordinals() {
        let db = Database::open_in_memory().unwrap();
        let three: Vec<NewRecord> = (0..3).map(|i| segment("/t.json", i, "text")).collect();
        let first = replace_file(&db, "plain", "/t.json", &three).unwrap();
        assert_eq!(first.written.len(), 3);
        assert!(first.retired.is_empty());

        let one = vec![segment("/t.json", 0, "text")];
        let second = replace_file(&db, "plain", "/t.json", &one).unwrap();
        assert!(!second.written[0].changed);
        assert_eq!(second.retired, vec![first.written[1].id, first.written[2].id]);

        let live = live_sources(&db, "plain").unwrap();
        assert_eq!(live, vec![(first.written[0].id, "/t.json".to_string())]);
    }

    #[test]
    fn test_replace_file_leaves_other_paths_alone() {
        let db = Database::open_in_memory().unwrap();
        upsert(&db, &new_record("/other.txt", "x")).unwrap();
        let write = replace_file(&db, "plain", "/t.json", &[]).unwrap();
        assert!(write.retired.is_empty());
        assert_eq!(live_sources(&db, "plain").unwrap().len(), 1);
    }

    #[test]
    fn test_replace_file_rolls_back_on_conflict() {
        let db = Database::open_in_memory().unwrap();
        let mut taken = segment("/t.json", 1, "owned elsewhere");
        taken.entity_kind = "speaker".into();
        upsert(&db, &taken).unwrap();

        let records: Vec<NewRecord> = (0..3).map(|i| segment("/t.json", i, "text")).collect();
        let err = replace_file(&db, "plain", "/t.json", &records).unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict(_)));

        // Segment 0 was written before the conflict and must be gone.
        assert_eq!(count(&db, "segment").unwrap(), 0);
        assert_eq!(count(&db, "speaker").unwrap(), 1);
    }

    #[test]
    fn test_insert_then_unchanged() {
        let db = Database::open_in_memory().unwrap();
        let first = upsert(&db, &new_record("/a.txt", "hello")).unwrap();
        assert!(first.changed);
        assert_eq!(first.version, 1);

        let again = upsert(&db, &new_record("/a.txt", "hello")).unwrap();
        assert!(!again.changed);
        assert_eq!(again.id, first.id);
        assert_eq!(again.version, 1);
        assert_eq!(count(&db, "segment").unwrap(), 1);
    }

    #[test]
    fn test_update_bumps_version() {
        let db = Database::open_in_memory().unwrap();
        let first = upsert(&db, &new_record("/a.txt", "hello")).unwrap();
        upsert(&db, &new_record("/b.txt", "other")).unwrap();
        let updated = upsert(&db, &new_record("/a.txt", "changed")).unwrap();

        assert!(updated.changed);
        assert_eq!(updated.id, first.id);
        assert_eq!(updated.version, 3);
    }

    #[test]
    fn test_identity_collision_is_conflict() {
        let db = Database::open_in_memory().unwrap();
        let mut record = new_record("/a.txt", "hello");
        upsert(&db, &record).unwrap();

        record.entity_kind = "speaker".into();
        let err = upsert(&db, &record).unwrap_err();
        assert!(matches!(err, DatabaseError::Conflict(_)));
    }

    #[test]
    fn test_changed_since_orders_by_version() {
        let db = Database::open_in_memory().unwrap();
        let a = upsert(&db, &new_record("/a.txt", "1")).unwrap();
        let b = upsert(&db, &new_record("/b.txt", "2")).unwrap();
        upsert(&db, &new_record("/a.txt", "3")).unwrap();

        let all = changed_since(&db, "segment", 0).unwrap();
        let ids: Vec<RecordId> = all.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![b.id, a.id]);

        let after = changed_since(&db, "segment", 2).unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].projection.text, "3");
    }

    #[test]
    fn test_mark_deleted() {
        let db = Database::open_in_memory().unwrap();
        let a = upsert(&db, &new_record("/a.txt", "1")).unwrap();

        let version = mark_deleted(&db, a.id).unwrap();
        assert_eq!(version, Some(2));
        assert_eq!(mark_deleted(&db, a.id).unwrap(), None);
        assert_eq!(mark_deleted(&db, RecordId(999)).unwrap(), None);

        let changes = changed_since(&db, "segment", 1).unwrap();
        assert_eq!(changes.len(), 1);
        assert!(changes[0].deleted);
        assert!(live_sources(&db, "plain").unwrap().is_empty());

        let revived = upsert(&db, &new_record("/a.txt", "1")).unwrap();
        assert!(revived.changed);
        assert_eq!(live_sources(&db, "plain").unwrap().len(), 1);
    }
}
