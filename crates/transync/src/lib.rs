pub mod broadcast;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod model;
pub mod parser;
pub mod retry;
pub mod sanitize;
pub mod store;
pub mod sync;
pub mod worker;

pub use broadcast::{FeedItem, JobStore, ProgressBus, ProgressEvent, Subscription};
pub use config::{load_settings, Settings, SourceConfig};
pub use coordinator::{JobCoordinator, JobHandle};
pub use db::Database;
pub use error::{
    ConfigError, CoordinatorError, EmbeddingError, IndexError, ParseError, Result, StoreError,
    TransyncError, ValidationError,
};
pub use index::{DocumentResult, EmbeddingClient, HashEmbedder, SearchIndex, SqliteSearchIndex};
pub use logging::{init_logging, LogFormat};
pub use model::{
    EntityKind, IndexDocument, ItemOutcome, JobCounters, JobId, JobKind, JobSnapshot, JobState,
    OutcomeStatus, Record, RecordId, ResourceKey, SourceKind, StructuredDocument,
};
pub use parser::{Parser, ParserRegistry};
pub use store::{RecordStore, SqliteRecordStore};
