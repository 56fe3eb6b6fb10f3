//! Supersession chain resolution
//!
//! Follows `superseded_by` pointers from any record to the live head of its
//! chain. Broken chains (dangling pointers, cycles) resolve to nothing
//! rather than failing: they indicate a data integrity problem, not a
//! condition the caller can recover from.

use std::collections::HashSet;

use uuid::Uuid;

use crate::error::Result;
use crate::memory::types::{MemoryRecord, SupersededBy};
use crate::storage::VectorIndex;

/// Outcome of walking a supersession chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The chain ends at this live record
    Live(MemoryRecord),
    /// The chain ends at a tombstone
    Deleted,
    /// A pointer (or the starting id) names a record that does not exist
    Dangling(Uuid),
    /// The chain revisits this id
    Cycle(Uuid),
}

impl Resolution {
    pub fn into_live(self) -> Option<MemoryRecord> {
        match self {
            Resolution::Live(record) => Some(record),
            _ => None,
        }
    }
}

/// Walks supersession chains against a vector index. Holds no state between
/// calls.
pub struct SupersessionResolver<'a> {
    index: &'a dyn VectorIndex,
}

impl<'a> SupersessionResolver<'a> {
    pub fn new(index: &'a dyn VectorIndex) -> Self {
        Self { index }
    }

    /// The live record `id` ultimately resolves to, if any.
    pub async fn resolve(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        Ok(self.trace(id).await?.into_live())
    }

    /// Walk the chain starting at `id`.
    pub async fn trace(&self, id: Uuid) -> Result<Resolution> {
        match self.index.get_by_id(id).await? {
            Some(record) => self.trace_record(record).await,
            None => Ok(Resolution::Dangling(id)),
        }
    }

    /// Walk the chain starting from an already loaded record.
    pub async fn trace_record(&self, start: MemoryRecord) -> Result<Resolution> {
        let start_id = start.id;
        let mut seen = HashSet::from([start.id]);
        let mut current = start;

        loop {
            let next = match current.superseded_by {
                None => return Ok(Resolution::Live(current)),
                Some(SupersededBy::Tombstone) => return Ok(Resolution::Deleted),
                Some(SupersededBy::Record(next)) => next,
            };

            if !seen.insert(next) {
                tracing::warn!(
                    start = %start_id,
                    repeated = %next,
                    "Supersession cycle detected"
                );
                return Ok(Resolution::Cycle(next));
            }

            current = match self.index.get_by_id(next).await? {
                Some(record) => record,
                None => {
                    tracing::warn!(
                        start = %start_id,
                        missing = %next,
                        "Supersession chain points at a missing memory"
                    );
                    return Ok(Resolution::Dangling(next));
                }
            };
        }
    }
}
