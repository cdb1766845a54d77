//! Job repository: archive of job snapshots in the `jobs` table.

use rusqlite::{params, OptionalExtension};

use super::{Database, DatabaseError};
use crate::model::JobSnapshot;

/// Inserts or replaces the archived snapshot of a job.
pub fn save(db: &Database, job: &JobSnapshot) -> Result<(), DatabaseError> {
    let snapshot =
        serde_json::to_string(job).map_err(|e| DatabaseError::Corrupt(e.to_string()))?;
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, kind, resource, state, snapshot, created_at, finished_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                snapshot = excluded.snapshot,
                finished_at = excluded.finished_at",
            params![
                job.id.as_str(),
                job.kind.to_string(),
                job.resource.as_str(),
                job.state.to_string(),
                snapshot,
                job.created_at.to_rfc3339(),
                job.finished_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    })
}

/// Finds an archived job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobSnapshot>, DatabaseError> {
    let raw: Option<String> = db.with_conn(|conn| {
        Ok(conn
            .query_row(
                "SELECT snapshot FROM jobs WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?)
    })?;

    raw.map(|s| serde_json::from_str(&s).map_err(|e| DatabaseError::Corrupt(e.to_string())))
        .transpose()
}

/// Most recent archived jobs, newest first.
pub fn recent(db: &Database, limit: u64) -> Result<Vec<JobSnapshot>, DatabaseError> {
    let raw: Vec<String> = db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT snapshot FROM jobs ORDER BY created_at DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![limit as i64], |r| r.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(rows)
    })?;

    let mut jobs = Vec::with_capacity(raw.len());
    for s in raw {
        match serde_json::from_str(&s) {
            Ok(job) => jobs.push(job),
            Err(e) => log::warn!("Skipping unreadable archived job: {}", e),
        }
    }
    Ok(jobs)
}
