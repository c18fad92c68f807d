#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod chunker;
pub mod pipeline;
pub mod task;
pub mod tracker;
pub mod watcher;

pub use chunker::{Chunker, ChunkerConfig, RawChunk};
pub use pipeline::IngestionPipeline;
pub use task::{TaskRegistry, TaskSnapshot, TaskStatus};
pub use tracker::{FileTracker, IngestDecision};
pub use watcher::{FileEvent, FileWatcher};
