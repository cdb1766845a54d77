//! Scripted adapters that fail on demand.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use async_trait::async_trait;

use transync::index::{DocumentResult, EmbeddingClient, SearchIndex};
use transync::model::{FileWrite, NewRecord, RawFile, VersionedId};
use transync::parser::PlainTextParser;
use transync::store::RecordStore;
use transync::{
    EmbeddingError, EntityKind, IndexDocument, IndexError, ParseError, Parser, Record, RecordId,
    SourceKind, StoreError, StructuredDocument,
};

use super::harness::{ENTITY_KIND, SOURCE_KIND};

fn plain() -> PlainTextParser {
    PlainTextParser::new(SOURCE_KIND.into(), ENTITY_KIND.into())
}

/// Plain-text parser that fails every file whose name contains `marker`.
pub struct FailingParser {
    inner: PlainTextParser,
    marker: String,
}

impl FailingParser {
    pub fn new(marker: &str) -> Self {
        Self {
            inner: plain(),
            marker: marker.to_string(),
        }
    }
}

impl Parser for FailingParser {
    fn name(&self) -> &str {
        "failing"
    }

    fn parse(&self, file: &RawFile) -> Result<Vec<StructuredDocument>, ParseError> {
        let name = file
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if name.contains(&self.marker) {
            return Err(ParseError::Malformed {
                path: file.path.clone(),
                message: "scripted parse failure".to_string(),
            });
        }
        self.inner.parse(file)
    }
}

/// Blocks parser calls until opened.
#[derive(Default)]
pub struct Gate {
    open: Mutex<bool>,
    cond: Condvar,
    entered: AtomicUsize,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn open(&self) {
        let mut open = self.open.lock().unwrap();
        *open = true;
        self.cond.notify_all();
    }

    /// Parser calls that reached the gate so far.
    pub fn entered(&self) -> usize {
        self.entered.load(Ordering::SeqCst)
    }

    fn pass(&self) {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut open = self.open.lock().unwrap();
        while !*open {
            open = self.cond.wait(open).unwrap();
        }
    }
}

/// Plain-text parser that waits on a [`Gate`] before parsing.
pub struct GatedParser {
    inner: PlainTextParser,
    gate: Arc<Gate>,
}

impl GatedParser {
    pub fn new(gate: Arc<Gate>) -> Self {
        Self {
            inner: plain(),
            gate,
        }
    }
}

impl Parser for GatedParser {
    fn name(&self) -> &str {
        "gated"
    }

    fn parse(&self, file: &RawFile) -> Result<Vec<StructuredDocument>, ParseError> {
        self.gate.pass();
        self.inner.parse(file)
    }
}

/// Record store whose writes always report an outage.
pub struct UnavailableStore<S> {
    inner: S,
    pub write_calls: AtomicUsize,
}

impl<S> UnavailableStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            write_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl<S: RecordStore> RecordStore for UnavailableStore<S> {
    async fn upsert(&self, _record: &NewRecord) -> Result<VersionedId, StoreError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn replace_file(
        &self,
        _source_kind: &SourceKind,
        _source_path: &str,
        _records: &[NewRecord],
    ) -> Result<FileWrite, StoreError> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::Unavailable("connection refused".to_string()))
    }

    async fn query_changed_since(
        &self,
        entity_kind: &EntityKind,
        marker: u64,
    ) -> Result<Vec<Record>, StoreError> {
        self.inner.query_changed_since(entity_kind, marker).await
    }

    async fn mark_deleted(&self, id: RecordId) -> Result<(), StoreError> {
        self.inner.mark_deleted(id).await
    }

    async fn live_sources(
        &self,
        source_kind: &SourceKind,
    ) -> Result<Vec<(RecordId, String)>, StoreError> {
        self.inner.live_sources(source_kind).await
    }
}

/// Search index that reports an outage for chosen upsert calls (1-based)
/// until healed.
pub struct FlakyIndex<I> {
    inner: I,
    outages: Mutex<HashSet<usize>>,
    calls: AtomicUsize,
    always: AtomicBool,
    healed: AtomicBool,
}

impl<I> FlakyIndex<I> {
    pub fn new(inner: I, outage_calls: &[usize]) -> Self {
        Self {
            inner,
            outages: Mutex::new(outage_calls.iter().copied().collect()),
            calls: AtomicUsize::new(0),
            always: AtomicBool::new(false),
            healed: AtomicBool::new(false),
        }
    }

    /// Fails every upsert until healed.
    pub fn down(inner: I) -> Self {
        let index = Self::new(inner, &[]);
        index.always.store(true, Ordering::SeqCst);
        index
    }

    pub fn heal(&self) {
        self.healed.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn is_down(&self, call: usize) -> bool {
        if self.healed.load(Ordering::SeqCst) {
            return false;
        }
        self.always.load(Ordering::SeqCst) || self.outages.lock().unwrap().contains(&call)
    }
}

#[async_trait]
impl<I: SearchIndex> SearchIndex for FlakyIndex<I> {
    async fn upsert_batch(
        &self,
        documents: &[IndexDocument],
    ) -> Result<Vec<DocumentResult>, IndexError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.is_down(call) {
            return Err(IndexError::Unavailable(format!(
                "scripted outage on call {}",
                call
            )));
        }
        self.inner.upsert_batch(documents).await
    }

    async fn delete_batch(&self, ids: &[RecordId]) -> Result<(), IndexError> {
        self.inner.delete_batch(ids).await
    }
}

/// Embedding client that is always down.
pub struct DownEmbedder {
    pub calls: AtomicUsize,
}

impl DownEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EmbeddingClient for DownEmbedder {
    async fn request_embeddings(
        &self,
        _texts: Vec<String>,
    ) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(EmbeddingError::Unavailable("model offline".to_string()))
    }
}
