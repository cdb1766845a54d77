//! Per-job progress bus with last-known-state snapshots.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::model::{ItemOutcome, JobCounters, JobId, JobKind, JobSnapshot, JobState};

/// Immutable view of a job's counters and state at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub job_id: JobId,
    /// Strictly increasing per job.
    pub sequence: u64,
    pub kind: JobKind,
    pub state: JobState,
    pub counters: JobCounters,
    pub message: String,
    /// Outcomes appended by the change this event reports.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outcomes: Vec<ItemOutcome>,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn from_snapshot(snapshot: &JobSnapshot, outcomes: Vec<ItemOutcome>) -> Self {
        Self {
            job_id: snapshot.id.clone(),
            sequence: snapshot.sequence,
            kind: snapshot.kind,
            state: snapshot.state,
            counters: snapshot.counters,
            message: snapshot.message.clone(),
            outcomes,
            timestamp: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// One item of a subscription feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedItem {
    Event(ProgressEvent),
    /// The subscriber fell more than the buffer size behind and was dropped.
    Overflow { missed: u64 },
}

struct Channel {
    /// `None` once the terminal event has been sent.
    sender: Option<broadcast::Sender<ProgressEvent>>,
    latest: ProgressEvent,
}

/// In-process publish/subscribe of progress events, one channel per job.
///
/// Publishing never waits on subscribers: each channel holds at most
/// `capacity` undelivered events per subscriber.
pub struct ProgressBus {
    channels: Mutex<HashMap<JobId, Channel>>,
    capacity: usize,
}

impl ProgressBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, Channel>> {
        match self.channels.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Progress bus lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Publishes an event. Events at or below the latest sequence for the job,
    /// and anything after the terminal event, are discarded.
    pub fn publish(&self, event: ProgressEvent) {
        let mut channels = self.lock();

        let channel = match channels.entry(event.job_id.clone()) {
            Entry::Vacant(slot) => {
                let (sender, _) = broadcast::channel(self.capacity);
                slot.insert(Channel {
                    sender: (!event.is_terminal()).then_some(sender),
                    latest: event,
                });
                return;
            }
            Entry::Occupied(slot) => slot.into_mut(),
        };

        if event.sequence <= channel.latest.sequence {
            log::debug!(
                "Dropping stale progress event {} for job {}",
                event.sequence,
                event.job_id
            );
            return;
        }

        let Some(sender) = channel.sender.as_ref() else {
            log::warn!(
                "Progress event {} for finished job {} ignored",
                event.sequence,
                event.job_id
            );
            return;
        };

        // No receivers is fine
        let _ = sender.send(event.clone());

        if event.is_terminal() {
            channel.sender = None;
        }
        channel.latest = event;
    }

    /// Opens a feed: the current snapshot first, then only later events.
    pub fn subscribe(&self, job_id: &JobId) -> Option<Subscription> {
        let channels = self.lock();
        let channel = channels.get(job_id)?;
        Some(Subscription {
            pending: Some(channel.latest.clone()),
            receiver: channel.sender.as_ref().map(|s| s.subscribe()),
            last_sequence: 0,
        })
    }

    pub fn latest(&self, job_id: &JobId) -> Option<ProgressEvent> {
        self.lock().get(job_id).map(|c| c.latest.clone())
    }

    pub fn remove(&self, job_id: &JobId) {
        self.lock().remove(job_id);
    }

    pub fn subscriber_count(&self, job_id: &JobId) -> usize {
        self.lock()
            .get(job_id)
            .and_then(|c| c.sender.as_ref().map(|s| s.receiver_count()))
            .unwrap_or(0)
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// A live feed for one job. Finite: ends after the terminal event or an
/// overflow signal.
pub struct Subscription {
    pending: Option<ProgressEvent>,
    receiver: Option<broadcast::Receiver<ProgressEvent>>,
    last_sequence: u64,
}

impl Subscription {
    /// A feed holding a single, already-terminal snapshot.
    pub fn finished(event: ProgressEvent) -> Self {
        Self {
            pending: Some(event),
            receiver: None,
            last_sequence: 0,
        }
    }

    /// Next feed item, or `None` once the feed is closed.
    pub async fn next(&mut self) -> Option<FeedItem> {
        if let Some(event) = self.pending.take() {
            return Some(self.deliver(event));
        }

        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(event) => {
                    if event.sequence <= self.last_sequence {
                        continue;
                    }
                    return Some(self.deliver(event));
                }
                Err(RecvError::Lagged(missed)) => {
                    self.receiver = None;
                    return Some(FeedItem::Overflow { missed });
                }
                Err(RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    fn deliver(&mut self, event: ProgressEvent) -> FeedItem {
        self.last_sequence = event.sequence;
        if event.is_terminal() {
            self.receiver = None;
        }
        FeedItem::Event(event)
    }

    /// Drains the feed into a vector. Test and CLI helper.
    pub async fn collect(mut self) -> Vec<FeedItem> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item);
        }
        items
    }
}
