//! The priority-ordered download pipeline.
//!
//! This module is the core of the service: an in-memory registry with
//! prioritized dispatch, a bounded pool of download workers, cooperative
//! per-item cancellation, per-URL retry with fallback, and a background
//! sweeper that keeps the registry honest about what is actually on disk.

mod fetcher;
mod models;
mod queue;
mod registry;
mod worker;

pub mod sweeper;

// Re-export the public API
pub use fetcher::{FetchError, Fetcher};
pub use models::{BookInfo, QueueOrderItem, QueueStatus, parse_size, sanitize_filename};
pub use queue::{PriorityQueue, QueueEntry};
pub use registry::Registry;
pub use worker::WorkerPool;
