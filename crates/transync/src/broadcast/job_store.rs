//! Owned job registry with retention and best-effort archiving.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;

use crate::coordinator::JobHandle;
use crate::db::{job_repo, Database};
use crate::model::{JobId, JobSnapshot};

struct Entry {
    handle: Arc<JobHandle>,
    /// Set once the terminal snapshot went through `archive`.
    archived: bool,
}

/// Jobs of one coordinator: live handles in memory, terminal snapshots
/// archived to the database.
pub struct JobStore {
    jobs: RwLock<HashMap<JobId, Entry>>,
    db: Option<Database>,
    retention: Duration,
}

impl JobStore {
    pub fn new(db: Option<Database>, retention: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            db,
            retention,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, Entry>> {
        match self.jobs.read() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job store lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Entry>> {
        match self.jobs.write() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job store lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    pub fn insert(&self, handle: Arc<JobHandle>) {
        self.write().insert(
            handle.id().clone(),
            Entry {
                handle,
                archived: false,
            },
        );
    }

    pub fn get(&self, id: &JobId) -> Option<Arc<JobHandle>> {
        self.read().get(id).map(|e| Arc::clone(&e.handle))
    }

    /// Current snapshot from memory, falling back to the archive.
    pub fn snapshot(&self, id: &JobId) -> Option<JobSnapshot> {
        if let Some(handle) = self.get(id) {
            return Some(handle.snapshot());
        }

        let db = self.db.as_ref()?;
        match job_repo::find_by_id(db, id.as_str()) {
            Ok(found) => found,
            Err(e) => {
                log::warn!("Failed to read archived job {}: {}", id, e);
                None
            }
        }
    }

    /// In-memory snapshots, newest first.
    pub fn list(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<JobSnapshot> = self.read().values().map(|e| e.handle.snapshot()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Saves a snapshot to the archive. True when it is durable, or when
    /// there is no database to save to.
    fn persist(&self, snapshot: &JobSnapshot) -> bool {
        let Some(db) = self.db.as_ref() else {
            return true;
        };
        match job_repo::save(db, snapshot) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to archive job {}: {}", snapshot.id, e);
                false
            }
        }
    }

    /// Persists a terminal snapshot. Only a successfully archived job becomes
    /// eligible for eviction. Failures are logged, never surfaced.
    pub fn archive(&self, snapshot: &JobSnapshot) {
        let saved = self.persist(snapshot);
        if saved && snapshot.is_finished() {
            if let Some(entry) = self.write().get_mut(&snapshot.id) {
                entry.archived = true;
            }
        }
    }

    /// Drops archived jobs that finished longer than the retention window ago.
    /// Expired jobs whose archive write failed earlier are saved again first
    /// and stay in memory while that keeps failing. Returns the evicted ids.
    pub fn evict_expired(&self) -> Vec<JobId> {
        let Some(cutoff) = chrono::Duration::from_std(self.retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return Vec::new();
        };

        let mut jobs = self.write();
        let mut expired = Vec::new();
        for (id, entry) in jobs.iter_mut() {
            let snapshot = entry.handle.snapshot();
            let due = matches!(
                snapshot.finished_at,
                Some(finished) if snapshot.is_finished() && finished <= cutoff
            );
            if !due {
                continue;
            }
            if !entry.archived {
                entry.archived = self.persist(&snapshot);
            }
            if entry.archived {
                expired.push(id.clone());
            }
        }

        for id in &expired {
            jobs.remove(id);
            log::debug!("Evicted job {} from memory", id);
        }
        expired
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
