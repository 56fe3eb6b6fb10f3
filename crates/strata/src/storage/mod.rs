//! Vector index backends
//!
//! The memory service depends only on the `VectorIndex` contract; which
//! engine sits behind it is decided at construction time.

pub mod lance;
pub mod memory;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Result, StrataError};
use crate::memory::types::{MemoryRecord, RecordUpdate, SupersededBy};

pub use lance::LanceIndex;
pub use memory::InMemoryIndex;

/// A nearest-neighbor candidate returned by an index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    pub id: Uuid,
    /// Distance to the query vector (smaller is closer)
    pub distance: f32,
}

/// Record counts by supersession state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StateCounts {
    /// No forward pointer
    pub live: usize,
    /// Replaced by another record
    pub superseded: usize,
    /// Tombstoned
    pub deleted: usize,
}

impl StateCounts {
    pub fn total(&self) -> usize {
        self.live + self.superseded + self.deleted
    }

    pub(crate) fn tally(&mut self, record: &MemoryRecord) {
        match record.superseded_by {
            None => self.live += 1,
            Some(SupersededBy::Record(_)) => self.superseded += 1,
            Some(SupersededBy::Tombstone) => self.deleted += 1,
        }
    }
}

/// Persistence and nearest-neighbor lookup for memory records.
///
/// Implementations serialize their own concurrent reads and writes; a
/// record is written whole, exactly once, by `insert`/`insert_batch`.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Persist a new record. Ids are never reused; inserting an id that
    /// already exists is an error.
    async fn insert(&self, record: &MemoryRecord) -> Result<()>;

    /// Persist several records. Nothing is written if any record is
    /// rejected.
    async fn insert_batch(&self, records: &[MemoryRecord]) -> Result<()> {
        for record in records {
            self.insert(record).await?;
        }
        Ok(())
    }

    /// Point lookup; `None` when no record has this id
    async fn get_by_id(&self, id: Uuid) -> Result<Option<MemoryRecord>>;

    /// Apply a partial update. Returns `false` if no record matched.
    async fn update_fields(&self, id: Uuid, update: &RecordUpdate) -> Result<bool>;

    /// Up to `k` nearest records, ordered by ascending distance
    async fn nearest_neighbors(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>>;

    /// Number of stored records, superseded ones included
    async fn count(&self) -> Result<usize>;

    /// Live, superseded, and deleted record counts
    async fn state_counts(&self) -> Result<StateCounts>;

    /// Build an approximate nearest-neighbor index if the backend has one and
    /// the data is large enough. Returns whether an index was built by this
    /// call.
    async fn ensure_vector_index(&self) -> Result<bool> {
        Ok(false)
    }

    /// Vector width every stored embedding must have
    fn dimension(&self) -> usize;
}

/// Reject embeddings whose width differs from the index's.
pub(crate) fn check_dimension(expected: usize, embedding: &[f32]) -> Result<()> {
    if embedding.len() != expected {
        return Err(StrataError::Storage(format!(
            "Embedding dimension mismatch: expected {expected}, got {}",
            embedding.len()
        )));
    }
    Ok(())
}

/// Cosine distance in `[0, 2]`; zero vectors are treated as maximally far.
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 2.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 2.0;
    }

    1.0 - (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}
