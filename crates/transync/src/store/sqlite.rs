use async_trait::async_trait;

use super::RecordStore;
use crate::db::{record_repo, Database};
use crate::error::StoreError;
use crate::model::{EntityKind, FileWrite, NewRecord, Record, RecordId, SourceKind, VersionedId};

/// Record store backed by the local SQLite database.
#[derive(Clone)]
pub struct SqliteRecordStore {
    db: Database,
}

impl SqliteRecordStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl RecordStore for SqliteRecordStore {
    async fn upsert(&self, record: &NewRecord) -> Result<VersionedId, StoreError> {
        Ok(record_repo::upsert(&self.db, record)?)
    }

    async fn replace_file(
        &self,
        source_kind: &SourceKind,
        source_path: &str,
        records: &[NewRecord],
    ) -> Result<FileWrite, StoreError> {
        Ok(record_repo::replace_file(
            &self.db,
            source_kind.as_str(),
            source_path,
            records,
        )?)
    }

    async fn query_changed_since(
        &self,
        entity_kind: &EntityKind,
        marker: u64,
    ) -> Result<Vec<Record>, StoreError> {
        Ok(record_repo::changed_since(
            &self.db,
            entity_kind.as_str(),
            marker,
        )?)
    }

    async fn mark_deleted(&self, id: RecordId) -> Result<(), StoreError> {
        if record_repo::mark_deleted(&self.db, id)?.is_none() {
            log::debug!("Record {} already deleted or missing", id);
        }
        Ok(())
    }

    async fn live_sources(
        &self,
        source_kind: &SourceKind,
    ) -> Result<Vec<(RecordId, String)>, StoreError> {
        Ok(record_repo::live_sources(&self.db, source_kind.as_str())?)
    }
}
