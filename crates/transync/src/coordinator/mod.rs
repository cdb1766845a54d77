//! Job coordinator: admission, task lifecycle and the job control surface.

pub mod handle;

pub use handle::JobHandle;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, info};

use crate::broadcast::{FeedItem, JobStore, ProgressBus, ProgressEvent, Subscription};
use crate::config::{validate_settings, Settings, SourceConfig};
use crate::db::Database;
use crate::error::{ConfigError, CoordinatorError, TransyncError};
use crate::index::{EmbeddingClient, HashEmbedder, SearchIndex, SqliteSearchIndex};
use crate::ingest::IngestJob;
use crate::model::{EntityKind, JobId, JobKind, JobSnapshot, JobState, ResourceKey, SourceKind};
use crate::parser::ParserRegistry;
use crate::retry::RetryPolicy;
use crate::store::{RecordStore, SqliteRecordStore};
use crate::sync::SyncRun;

/// State shared with the spawned job tasks.
struct Shared {
    bus: Arc<ProgressBus>,
    jobs: JobStore,
    /// Current holder of each resource key.
    active: Mutex<HashMap<ResourceKey, Arc<JobHandle>>>,
}

impl Shared {
    fn active(&self) -> MutexGuard<'_, HashMap<ResourceKey, Arc<JobHandle>>> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!("Active job table lock was poisoned, recovering");
                poisoned.into_inner()
            }
        }
    }

    fn release(&self, resource: &ResourceKey, job_id: &JobId) {
        let mut active = self.active();
        if active.get(resource).is_some_and(|h| h.id() == job_id) {
            active.remove(resource);
            debug!("Released resource {} held by job {}", resource, job_id);
        }
    }

    fn evict_expired(&self) {
        for id in self.jobs.evict_expired() {
            self.bus.remove(&id);
        }
    }
}

/// Runs ingestion and sync jobs with at most one active job per resource.
///
/// Start calls return immediately with the new job id; the work runs as a
/// tokio task, so they must be called from within a runtime.
#[derive(Clone)]
pub struct JobCoordinator {
    settings: Arc<Settings>,
    db: Database,
    store: Arc<dyn RecordStore>,
    index: Arc<dyn SearchIndex>,
    embedder: Option<Arc<dyn EmbeddingClient>>,
    parsers: ParserRegistry,
    shared: Arc<Shared>,
}

impl JobCoordinator {
    pub fn new(
        settings: Settings,
        db: Database,
        store: Arc<dyn RecordStore>,
        index: Arc<dyn SearchIndex>,
    ) -> Self {
        let parsers = ParserRegistry::from_sources(&settings.sources);
        let shared = Arc::new(Shared {
            bus: Arc::new(ProgressBus::new(settings.jobs.subscriber_buffer)),
            jobs: JobStore::new(Some(db.clone()), settings.jobs.retention()),
            active: Mutex::new(HashMap::new()),
        });
        Self {
            settings: Arc::new(settings),
            db,
            store,
            index,
            embedder: None,
            parsers,
            shared,
        }
    }

    /// Validates `settings`, opens the configured database and wires the
    /// SQLite record store and search index.
    pub fn open(settings: Settings) -> Result<Self, TransyncError> {
        validate_settings(&settings)?;
        let path = settings
            .resolved_database_path()
            .ok_or_else(|| ConfigError::Validation {
                message: "No database_path configured and no home directory found".to_string(),
            })?;
        let db = Database::open(&path)?;
        info!("Opened database at {}", path.display());

        let embeddings = settings.sync.embeddings;
        let store = Arc::new(SqliteRecordStore::new(db.clone()));
        let index = Arc::new(SqliteSearchIndex::new(db.clone()));
        let coordinator = Self::new(settings, db, store, index);
        Ok(if embeddings {
            coordinator.with_embedder(Arc::new(HashEmbedder::default()))
        } else {
            coordinator
        })
    }

    pub fn with_embedder(mut self, embedder: Arc<dyn EmbeddingClient>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Replaces the parsers built from the configured sources.
    pub fn with_parsers(mut self, parsers: ParserRegistry) -> Self {
        self.parsers = parsers;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn bus(&self) -> &Arc<ProgressBus> {
        &self.shared.bus
    }

    /// Starts ingestion of a configured source kind.
    pub fn start_ingest(&self, kind: &SourceKind) -> Result<JobId, CoordinatorError> {
        let source = self
            .settings
            .source(kind)
            .cloned()
            .ok_or_else(|| CoordinatorError::UnknownSource(kind.to_string()))?;
        self.start_ingest_with(source)
    }

    /// Starts ingestion with an explicit discovery configuration.
    pub fn start_ingest_with(&self, source: SourceConfig) -> Result<JobId, CoordinatorError> {
        let parser = self
            .parsers
            .get(&source.kind)
            .map_err(|_| CoordinatorError::UnknownSource(source.kind.to_string()))?;
        let resource = ResourceKey::ingest(&source.kind);
        let handle = self.admit(JobKind::Ingest, resource.clone())?;

        let job = IngestJob::new(
            Arc::clone(&handle),
            source,
            parser,
            Arc::clone(&self.store),
            &self.settings.ingest,
            RetryPolicy::new(&self.settings.retry, self.settings.ingest.max_attempts),
        );
        info!("Started ingest job {} on {}", handle.id(), resource);
        self.spawn(Arc::clone(&handle), resource, job.run());
        Ok(handle.id().clone())
    }

    /// Starts a sync run for an entity kind.
    pub fn start_sync(&self, entity_kind: &EntityKind) -> Result<JobId, CoordinatorError> {
        let resource = ResourceKey::search_index(entity_kind);
        let handle = self.admit(JobKind::Sync, resource.clone())?;

        let run = SyncRun::new(
            Arc::clone(&handle),
            entity_kind.clone(),
            self.db.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.index),
            self.embedder.clone(),
            &self.settings.sync,
            RetryPolicy::new(&self.settings.retry, self.settings.sync.max_attempts),
        );
        info!("Started sync job {} on {}", handle.id(), resource);
        self.spawn(Arc::clone(&handle), resource, run.run());
        Ok(handle.id().clone())
    }

    /// Requests cooperative cancellation. False unless the job is running.
    pub fn cancel(&self, job_id: &JobId) -> bool {
        let Some(handle) = self.shared.jobs.get(job_id) else {
            debug!("Cancel for unknown job {}", job_id);
            return false;
        };
        let accepted = handle.request_cancel();
        if accepted {
            info!("Cancellation requested for job {}", job_id);
        }
        accepted
    }

    /// Current snapshot; falls back to the archive once evicted.
    pub fn status(&self, job_id: &JobId) -> Result<JobSnapshot, CoordinatorError> {
        self.shared.evict_expired();
        self.shared
            .jobs
            .snapshot(job_id)
            .ok_or_else(|| CoordinatorError::NotFound(job_id.clone()))
    }

    /// Live progress feed. An archived job yields its terminal snapshot only.
    pub fn subscribe(&self, job_id: &JobId) -> Result<Subscription, CoordinatorError> {
        self.shared.evict_expired();
        if let Some(subscription) = self.shared.bus.subscribe(job_id) {
            return Ok(subscription);
        }
        self.shared
            .jobs
            .snapshot(job_id)
            .map(|snapshot| {
                Subscription::finished(ProgressEvent::from_snapshot(&snapshot, Vec::new()))
            })
            .ok_or_else(|| CoordinatorError::NotFound(job_id.clone()))
    }

    /// Resolves with the terminal snapshot once the job settles.
    pub async fn wait(&self, job_id: &JobId) -> Result<JobSnapshot, CoordinatorError> {
        loop {
            let mut feed = self.subscribe(job_id)?;
            let mut overflowed = false;
            while let Some(item) = feed.next().await {
                match item {
                    FeedItem::Event(event) if event.is_terminal() => break,
                    FeedItem::Event(_) => {}
                    FeedItem::Overflow { missed } => {
                        debug!("Wait on job {} lagged by {} events, resubscribing", job_id, missed);
                        overflowed = true;
                        break;
                    }
                }
            }
            if !overflowed {
                return self.status(job_id);
            }
        }
    }

    /// In-memory jobs, newest first.
    pub fn list(&self) -> Vec<JobSnapshot> {
        self.shared.evict_expired();
        self.shared.jobs.list()
    }

    /// Registers a new job unless a non-terminal job holds the resource.
    fn admit(
        &self,
        kind: JobKind,
        resource: ResourceKey,
    ) -> Result<Arc<JobHandle>, CoordinatorError> {
        self.shared.evict_expired();

        let mut active = self.shared.active();
        if let Some(holder) = active.get(&resource) {
            if !holder.is_terminal() {
                info!("Rejected {} job: {} is held by job {}", kind, resource, holder.id());
                return Err(CoordinatorError::ResourceBusy {
                    resource,
                    job_id: holder.id().clone(),
                });
            }
        }

        let handle = JobHandle::new(kind, resource.clone(), Arc::clone(&self.shared.bus));
        active.insert(resource, Arc::clone(&handle));
        self.shared.jobs.insert(Arc::clone(&handle));
        Ok(handle)
    }

    fn spawn<F>(&self, handle: Arc<JobHandle>, resource: ResourceKey, run: F)
    where
        F: Future<Output = JobState> + Send + 'static,
    {
        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(run);
        tokio::spawn(async move {
            match task.await {
                Ok(state) => debug!("Job {} task ended {}", handle.id(), state),
                Err(e) => {
                    error!("Job {} task aborted: {}", handle.id(), e);
                    handle.finish(JobState::Failed, format!("Job task aborted: {}", e));
                }
            }
            shared.jobs.archive(&handle.snapshot());
            shared.release(&resource, handle.id());
        });
    }
}
