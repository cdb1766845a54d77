//! Progress streaming and job bookkeeping.

pub mod job_store;
pub mod progress;

pub use job_store::JobStore;
pub use progress::{FeedItem, ProgressBus, ProgressEvent, Subscription};
