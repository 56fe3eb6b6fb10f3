//! Strata - Semantically searchable memory store
//!
//! Free-text memories are embedded into fixed-dimension vectors, persisted
//! alongside their metadata, and retrieved by similarity. Updates and
//! deletions never mutate a memory in place: a memory is superseded by a
//! forward pointer to its replacement (or to a tombstone), and search
//! resolves those chains back to live records.

pub mod config;
pub mod embedding;
pub mod error;
pub mod logging;
pub mod memory;
pub mod storage;
pub mod testing;

pub use error::{Result, StrataError};
pub use memory::{MemoryRecord, MemoryService, Metadata, SearchHit, SupersededBy};
