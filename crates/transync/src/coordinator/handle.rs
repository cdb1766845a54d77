//! Single-writer ownership of one job's state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

use crate::broadcast::{ProgressBus, ProgressEvent};
use crate::model::{ItemOutcome, JobId, JobKind, JobSnapshot, JobState, ResourceKey};

/// Owns a job's snapshot. Every mutation goes through here, assigns the
/// next sequence number and publishes the resulting event while the
/// snapshot lock is held, so `snapshot()` and the event feed never disagree.
pub struct JobHandle {
    id: JobId,
    state: Mutex<JobSnapshot>,
    cancel: AtomicBool,
    bus: Arc<ProgressBus>,
}

impl JobHandle {
    /// Creates a queued job and publishes its first snapshot.
    pub fn new(kind: JobKind, resource: ResourceKey, bus: Arc<ProgressBus>) -> Arc<Self> {
        let snapshot = JobSnapshot::new(kind, resource);
        bus.publish(ProgressEvent::from_snapshot(&snapshot, Vec::new()));
        Arc::new(Self {
            id: snapshot.id.clone(),
            state: Mutex::new(snapshot),
            cancel: AtomicBool::new(false),
            bus,
        })
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    fn lock(&self) -> MutexGuard<'_, JobSnapshot> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Job {} state lock was poisoned, recovering", self.id);
                poisoned.into_inner()
            }
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        self.lock().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.lock().state.is_terminal()
    }

    /// Cooperative cancellation flag, polled between items.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Applies `mutate` and publishes one event. Terminal jobs are immutable:
    /// the closure is not run and `false` is returned.
    fn update<F>(&self, outcomes: Vec<ItemOutcome>, mutate: F) -> bool
    where
        F: FnOnce(&mut JobSnapshot),
    {
        let mut snapshot = self.lock();
        if snapshot.state.is_terminal() {
            log::debug!("Ignoring update to finished job {}", self.id);
            return false;
        }

        mutate(&mut snapshot);
        snapshot.outcomes.extend(outcomes.iter().cloned());
        snapshot.sequence += 1;
        debug_assert!(snapshot.counters.is_consistent());

        self.bus
            .publish(ProgressEvent::from_snapshot(&snapshot, outcomes));
        true
    }

    /// `queued -> running`.
    pub fn start(&self, message: impl Into<String>) -> bool {
        let message = message.into();
        let mut started = false;
        self.update(Vec::new(), |s| {
            if s.state.can_transition_to(JobState::Running) {
                s.state = JobState::Running;
                s.started_at = Some(Utc::now());
                started = true;
            }
            s.message = message;
        });
        started
    }

    pub fn set_total(&self, total: u64, message: impl Into<String>) {
        let message = message.into();
        self.update(Vec::new(), |s| {
            s.counters.total = total.max(s.counters.processed);
            s.message = message;
        });
    }

    /// Appends one item outcome and bumps the matching counters.
    pub fn record(&self, outcome: ItemOutcome) {
        self.record_batch(vec![outcome], 0, false);
    }

    /// Appends a group of outcomes as a single event.
    pub fn record_batch(&self, outcomes: Vec<ItemOutcome>, deleted: u64, degraded: bool) {
        let statuses: Vec<_> = outcomes.iter().map(|o| o.status).collect();
        self.update(outcomes, |s| {
            for status in statuses {
                s.counters.record(status);
            }
            if s.counters.processed > s.counters.total {
                s.counters.total = s.counters.processed;
            }
            s.counters.deleted += deleted;
            if degraded {
                s.counters.degraded += 1;
            }
            s.message = format!(
                "{}/{} processed",
                s.counters.processed, s.counters.total
            );
        });
    }

    pub fn add_deleted(&self, deleted: u64, message: impl Into<String>) {
        let message = message.into();
        self.update(Vec::new(), |s| {
            s.counters.deleted += deleted;
            s.message = message;
        });
    }

    /// `running -> cancelling`. Returns false in any other state.
    pub fn request_cancel(&self) -> bool {
        let mut snapshot = self.lock();
        if snapshot.state != JobState::Running {
            return false;
        }
        snapshot.state = JobState::Cancelling;
        snapshot.cancel_requested = true;
        snapshot.message = "Cancellation requested".to_string();
        snapshot.sequence += 1;
        self.cancel.store(true, Ordering::Release);
        self.bus
            .publish(ProgressEvent::from_snapshot(&snapshot, Vec::new()));
        true
    }

    /// Settles the job in a terminal state.
    ///
    /// A job that is cancelling always ends `cancelled`. Returns the state
    /// the job ended in, or `None` if it was already terminal.
    pub fn finish(&self, requested: JobState, message: impl Into<String>) -> Option<JobState> {
        let message = message.into();
        let mut settled = None;
        self.update(Vec::new(), |s| {
            let target = if s.state == JobState::Cancelling {
                JobState::Cancelled
            } else {
                requested
            };
            let target = if s.state.can_transition_to(target) {
                target
            } else {
                log::warn!(
                    "Job {} cannot move from {} to {}, marking failed",
                    s.id,
                    s.state,
                    target
                );
                JobState::Failed
            };
            s.state = target;
            s.finished_at = Some(Utc::now());
            s.message = message;
            settled = Some(target);
        });
        settled
    }
}
