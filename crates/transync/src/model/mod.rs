//! Core data model shared by ingestion, sync and the coordinator.

pub mod document;
pub mod job;

pub use document::{
    EntityKind, FileWrite, IndexDocument, NewRecord, RawFile, Record, RecordId, RecordProjection,
    SourceKind, StructuredDocument, VersionedId, DOCUMENT_SCHEMA_VERSION,
};
pub use job::{
    ItemOutcome, JobCounters, JobId, JobKind, JobSnapshot, JobState, OutcomeStatus, ResourceKey,
};
