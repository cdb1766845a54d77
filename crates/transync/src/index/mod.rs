//! Search index adapter and embedding client abstractions.

use async_trait::async_trait;

use crate::error::{EmbeddingError, IndexError};
use crate::model::{IndexDocument, RecordId};

pub mod embedding;
pub mod sqlite;

pub use embedding::HashEmbedder;
pub use sqlite::{SearchHit, SqliteSearchIndex};

/// Per-document result of a batch upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentResult {
    pub id: RecordId,
    pub error: Option<IndexError>,
}

impl DocumentResult {
    pub fn ok(id: RecordId) -> Self {
        Self { id, error: None }
    }

    pub fn rejected(id: RecordId, error: IndexError) -> Self {
        Self {
            id,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Batched writes into the hybrid search engine.
///
/// A whole-call `Err` means nothing in the batch can be assumed written.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn upsert_batch(
        &self,
        documents: &[IndexDocument],
    ) -> Result<Vec<DocumentResult>, IndexError>;

    async fn delete_batch(&self, ids: &[RecordId]) -> Result<(), IndexError>;
}

/// Interface implemented by embedding backends.
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    /// Produce one vector per input text, in order.
    async fn request_embeddings(&self, texts: Vec<String>)
        -> Result<Vec<Vec<f32>>, EmbeddingError>;
}
