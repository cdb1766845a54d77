//! Job bookkeeping types: identity, state machine, counters and outcomes.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::document::{EntityKind, SourceKind};

/// Unique identifier of one ingestion or sync run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a job does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Ingest,
    Sync,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Ingest => write!(f, "ingest"),
            JobKind::Sync => write!(f, "sync"),
        }
    }
}

/// Lifecycle of a job.
///
/// `queued -> running -> {succeeded, failed, cancelled}` and
/// `running -> cancelling -> cancelled`. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    Cancelling,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Succeeded | JobState::Failed | JobState::Cancelled
        )
    }

    /// Returns true if moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Queued, Running)
                | (Queued, Failed)
                | (Running, Cancelling)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Cancelling, Cancelled)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Cancelling => "cancelling",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// The contended resource a job owns while active.
///
/// At most one non-terminal job may hold a given key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn ingest(source: &SourceKind) -> Self {
        Self(format!("ingest:{}", source))
    }

    pub fn search_index(entity: &EntityKind) -> Self {
        Self(format!("search-index:{}", entity))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result class of one processed item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Ok,
    Skipped,
    Failed,
}

/// Result of one item (a file for ingestion, a record for sync).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemOutcome {
    /// File path or record id.
    pub item: String,
    pub status: OutcomeStatus,
    /// Error message when failed, reason when skipped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Whether the failure came from an unavailable backend.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub unavailable: bool,
}

impl ItemOutcome {
    pub fn ok(item: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            status: OutcomeStatus::Ok,
            detail: None,
            unavailable: false,
        }
    }

    pub fn skipped(item: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            status: OutcomeStatus::Skipped,
            detail: Some(reason.into()),
            unavailable: false,
        }
    }

    pub fn failed(item: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            status: OutcomeStatus::Failed,
            detail: Some(error.into()),
            unavailable: false,
        }
    }

    /// A failure caused by an unreachable store or index.
    pub fn unavailable(item: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            unavailable: true,
            ..Self::failed(item, error)
        }
    }
}

/// Progress counters of a job.
///
/// `succeeded + failed + skipped == processed <= total` at all times.
/// `deleted` and `degraded` are informational breakdowns outside that identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCounters {
    pub total: u64,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    /// Records removed: index deletions during sync, pruned sources during ingest.
    pub deleted: u64,
    /// Sync batches written lexical-only because embeddings were unavailable.
    pub degraded: u64,
}

impl JobCounters {
    pub fn record(&mut self, status: OutcomeStatus) {
        self.processed += 1;
        match status {
            OutcomeStatus::Ok => self.succeeded += 1,
            OutcomeStatus::Skipped => self.skipped += 1,
            OutcomeStatus::Failed => self.failed += 1,
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.succeeded + self.failed + self.skipped == self.processed
            && self.processed <= self.total
    }
}

/// Point-in-time view of a job. This is also the job's authoritative state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: JobId,
    pub kind: JobKind,
    pub resource: ResourceKey,
    pub state: JobState,
    pub counters: JobCounters,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    pub cancel_requested: bool,
    /// Human-readable summary of the latest transition.
    pub message: String,
    /// Append-only outcome log.
    #[serde(default)]
    pub outcomes: Vec<ItemOutcome>,
    /// Sequence number of the latest published event.
    pub sequence: u64,
}

impl JobSnapshot {
    pub fn new(kind: JobKind, resource: ResourceKey) -> Self {
        Self {
            id: JobId::new(),
            kind,
            resource,
            state: JobState::Queued,
            counters: JobCounters::default(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            cancel_requested: false,
            message: "Job queued".to_string(),
            outcomes: Vec::new(),
            sequence: 0,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn failed_items(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Failed)
    }
}
