//! Memory records and the operations over them
//!
//! Defines the record model with its supersession pointer, the embedding
//! queue, chain resolution, and the service that ties them together.

pub mod filter;
pub mod queue;
pub mod resolver;
pub mod service;
pub mod types;

pub use filter::MetadataFilter;
pub use queue::EmbeddingQueue;
pub use resolver::{Resolution, SupersessionResolver};
pub use service::{MemoryService, MemoryStats, SearchHit};
pub use types::{MemoryRecord, Metadata, RecordUpdate, SupersededBy, TOMBSTONE};
