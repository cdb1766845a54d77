//! Record store adapter: the system of record for parsed entities.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{EntityKind, FileWrite, NewRecord, Record, RecordId, SourceKind, VersionedId};

pub mod sqlite;

pub use sqlite::SqliteRecordStore;

/// Durable upsert and change-feed access to stored records.
///
/// Implementations report transient outages as [`StoreError::Unavailable`] and
/// identity collisions as [`StoreError::Conflict`].
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Writes a record keyed by its natural key. Repeating an identical write
    /// must not create a new record nor a new version.
    async fn upsert(&self, record: &NewRecord) -> Result<VersionedId, StoreError>;

    /// Atomically replaces everything ingested from one source file: upserts
    /// `records` and marks deleted any live record of that path not among
    /// them. On error nothing of the file is applied.
    async fn replace_file(
        &self,
        source_kind: &SourceKind,
        source_path: &str,
        records: &[NewRecord],
    ) -> Result<FileWrite, StoreError>;

    /// Records with a change marker above `marker`, ascending by marker then id.
    async fn query_changed_since(
        &self,
        entity_kind: &EntityKind,
        marker: u64,
    ) -> Result<Vec<Record>, StoreError>;

    /// Flags a record deleted; the deletion surfaces in the change feed.
    async fn mark_deleted(&self, id: RecordId) -> Result<(), StoreError>;

    /// Live records of a source kind paired with their source path.
    async fn live_sources(
        &self,
        source_kind: &SourceKind,
    ) -> Result<Vec<(RecordId, String)>, StoreError>;
}
