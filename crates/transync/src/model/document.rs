//! Documents at the parser boundary and records at the store boundary.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ValidationError;

/// Current version of the structured document shape.
pub const DOCUMENT_SCHEMA_VERSION: u16 = 1;

macro_rules! string_kind {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

string_kind!(
    /// Input family an ingestion job reads, e.g. `transcript-html`.
    SourceKind
);
string_kind!(
    /// Record family a sync run propagates, e.g. `segment`.
    EntityKind
);

/// A discovered input file, read into memory.
#[derive(Debug, Clone)]
pub struct RawFile {
    pub path: PathBuf,
    pub source_kind: SourceKind,
    pub bytes: Vec<u8>,
}

impl RawFile {
    pub fn new(path: impl Into<PathBuf>, source_kind: SourceKind, bytes: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            source_kind,
            bytes,
        }
    }

    pub fn text_lossy(&self) -> String {
        String::from_utf8_lossy(&self.bytes).into_owned()
    }
}

/// Fixed, versioned output shape of every parser plug-in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredDocument {
    pub schema_version: u16,
    pub source_kind: SourceKind,
    pub entity_kind: EntityKind,
    pub title: String,
    /// Primary content. Must not be blank.
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl StructuredDocument {
    pub fn new(
        source_kind: SourceKind,
        entity_kind: EntityKind,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            schema_version: DOCUMENT_SCHEMA_VERSION,
            source_kind,
            entity_kind,
            title: title.into(),
            body: body.into(),
            attribution: None,
            recorded_at: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_attribution(mut self, attribution: impl Into<String>) -> Self {
        self.attribution = Some(attribution.into());
        self
    }

    pub fn with_recorded_at(mut self, recorded_at: DateTime<Utc>) -> Self {
        self.recorded_at = Some(recorded_at);
        self
    }

    /// Checks the shape before anything is written to the store.
    pub fn validate(&self, ordinal: usize, expected: &SourceKind) -> Result<(), ValidationError> {
        if self.schema_version != DOCUMENT_SCHEMA_VERSION {
            return Err(ValidationError::SchemaVersion {
                found: self.schema_version,
                expected: DOCUMENT_SCHEMA_VERSION,
            });
        }
        if &self.source_kind != expected {
            return Err(ValidationError::SourceMismatch {
                ordinal,
                expected: expected.to_string(),
                found: self.source_kind.to_string(),
            });
        }
        if self.entity_kind.as_str().trim().is_empty() {
            return Err(ValidationError::MissingEntityKind { ordinal });
        }
        if self.title.trim().is_empty() {
            return Err(ValidationError::MissingTitle { ordinal });
        }
        if self.body.trim().is_empty() {
            return Err(ValidationError::EmptyBody { ordinal });
        }
        Ok(())
    }

    /// Stable identity of the `ordinal`-th document parsed from `path`.
    pub fn natural_key(source_kind: &SourceKind, path: &Path, ordinal: usize) -> String {
        format!("{}:{}#{}", source_kind, path.display(), ordinal)
    }

    /// SHA-256 over the canonical JSON encoding.
    pub fn content_hash(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }

    pub fn projection(&self) -> RecordProjection {
        RecordProjection {
            title: self.title.clone(),
            text: self.body.clone(),
            attribution: self.attribution.clone(),
            recorded_at: self.recorded_at,
        }
    }
}

/// Identity assigned by the record store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Minimal fields the index needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordProjection {
    pub title: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
}

/// Upsert request sent to the record store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewRecord {
    pub entity_kind: EntityKind,
    pub source_kind: SourceKind,
    pub natural_key: String,
    pub source_path: String,
    pub content_hash: String,
    pub projection: RecordProjection,
}

impl NewRecord {
    pub fn from_document(doc: &StructuredDocument, path: &Path, ordinal: usize) -> Self {
        Self {
            entity_kind: doc.entity_kind.clone(),
            source_kind: doc.source_kind.clone(),
            natural_key: StructuredDocument::natural_key(&doc.source_kind, path, ordinal),
            source_path: path.display().to_string(),
            content_hash: doc.content_hash(),
            projection: doc.projection(),
        }
    }
}

/// Identity returned by an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionedId {
    pub id: RecordId,
    /// Change marker after the write.
    pub version: u64,
    /// False when the stored content was already identical.
    pub changed: bool,
}

/// Result of replacing all records of one source file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileWrite {
    /// One entry per written record, in input order.
    pub written: Vec<VersionedId>,
    /// Records of the file that are no longer produced, now marked deleted.
    pub retired: Vec<RecordId>,
}

impl FileWrite {
    /// True if any record was inserted, updated or retired.
    pub fn changed(&self) -> bool {
        !self.retired.is_empty() || self.written.iter().any(|w| w.changed)
    }
}

/// A record as read back from the store for sync.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    pub id: RecordId,
    pub entity_kind: EntityKind,
    pub natural_key: String,
    /// Monotonic change marker.
    pub version: u64,
    pub deleted: bool,
    pub projection: RecordProjection,
}

/// A document as handed to the search index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDocument {
    pub id: RecordId,
    pub entity_kind: EntityKind,
    pub version: u64,
    pub title: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recorded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl From<&Record> for IndexDocument {
    fn from(record: &Record) -> Self {
        Self {
            id: record.id,
            entity_kind: record.entity_kind.clone(),
            version: record.version,
            title: record.projection.title.clone(),
            text: record.projection.text.clone(),
            attribution: record.projection.attribution.clone(),
            recorded_at: record.projection.recorded_at,
            embedding: None,
        }
    }
}
