//! In-process vector index
//!
//! Brute-force cosine search over a concurrent map. Suitable for tests and
//! small ephemeral stores; nothing survives the process.

use std::collections::HashSet;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use crate::error::{Result, StrataError};
use crate::memory::types::{MemoryRecord, RecordUpdate};
use crate::storage::{Neighbor, StateCounts, VectorIndex, check_dimension, cosine_distance};

pub struct InMemoryIndex {
    records: DashMap<Uuid, MemoryRecord>,
    dimension: usize,
}

impl InMemoryIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            records: DashMap::new(),
            dimension,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn insert(&self, record: &MemoryRecord) -> Result<()> {
        check_dimension(self.dimension, &record.embedding)?;

        match self.records.entry(record.id) {
            Entry::Occupied(_) => Err(StrataError::Storage(format!(
                "Memory {} already exists",
                record.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(record.clone());
                Ok(())
            }
        }
    }

    async fn insert_batch(&self, records: &[MemoryRecord]) -> Result<()> {
        // Validate everything up front so a bad batch writes nothing.
        let mut batch_ids = HashSet::with_capacity(records.len());
        for record in records {
            check_dimension(self.dimension, &record.embedding)?;
            if !batch_ids.insert(record.id) || self.records.contains_key(&record.id) {
                return Err(StrataError::Storage(format!(
                    "Memory {} already exists",
                    record.id
                )));
            }
        }
        for record in records {
            self.insert(record).await?;
        }
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        Ok(self.records.get(&id).map(|entry| entry.value().clone()))
    }

    async fn update_fields(&self, id: Uuid, update: &RecordUpdate) -> Result<bool> {
        match self.records.get_mut(&id) {
            Some(mut entry) => {
                entry.value_mut().apply(update);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn nearest_neighbors(&self, vector: &[f32], k: usize) -> Result<Vec<Neighbor>> {
        check_dimension(self.dimension, vector)?;
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut neighbors: Vec<Neighbor> = self
            .records
            .iter()
            .map(|entry| Neighbor {
                id: *entry.key(),
                distance: cosine_distance(vector, &entry.value().embedding),
            })
            .collect();

        neighbors.sort_by(|a, b| a.distance.total_cmp(&b.distance).then_with(|| a.id.cmp(&b.id)));
        neighbors.truncate(k);
        Ok(neighbors)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.records.len())
    }

    async fn state_counts(&self) -> Result<StateCounts> {
        let mut counts = StateCounts::default();
        for entry in self.records.iter() {
            counts.tally(entry.value());
        }
        Ok(counts)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}
