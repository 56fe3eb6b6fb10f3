//! Memory service
//!
//! Orchestrates the write path (synchronous or queued embedding), point
//! reads, soft deletion, and the resolving similarity search:
//! 1. Embed the query and fetch `limit * overfetch_factor` candidates
//! 2. Resolve each candidate to its live head through the supersession chain
//! 3. Drop duplicates, unresolvable chains, and live records the metadata
//!    filter rejects, stopping at `limit`

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};
use uuid::Uuid;

use crate::config::{Config, QueueConfig, SearchConfig};
use crate::embedding::{EmbeddingProvider, FastEmbedProvider, ensure_dimension};
use crate::error::{Result, StrataError};
use crate::memory::filter::MetadataFilter;
use crate::memory::queue::EmbeddingQueue;
use crate::memory::resolver::{Resolution, SupersessionResolver};
use crate::memory::types::{MemoryRecord, Metadata, RecordUpdate, SupersededBy};
use crate::storage::{LanceIndex, StateCounts, VectorIndex};

/// A search result with information about how it was found
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// The live record
    pub memory: MemoryRecord,
    /// Distance of the candidate that led to `memory`
    pub distance: f32,
    /// Id of that candidate; differs from `memory.id` when the candidate
    /// was a superseded predecessor
    pub matched_id: Uuid,
}

impl SearchHit {
    /// Whether the hit came through a supersession chain
    pub fn via_supersession(&self) -> bool {
        self.matched_id != self.memory.id
    }
}

/// Snapshot of what the store holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Persisted records by supersession state
    pub records: StateCounts,
    /// Memories still waiting in the embedding queue
    pub queued: usize,
}

/// Entry point for storing, reading, deleting, and searching memories
pub struct MemoryService {
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
    queue: EmbeddingQueue,
    overfetch_factor: usize,
    default_limit: usize,
}

impl MemoryService {
    /// Create a service over an existing provider and index
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        search: &SearchConfig,
        queue: &QueueConfig,
    ) -> Self {
        let queue = EmbeddingQueue::new(embedder.clone(), index.clone(), queue.flush_threshold);
        Self {
            embedder,
            index,
            queue,
            overfetch_factor: search.overfetch_factor.max(1),
            default_limit: search.default_limit,
        }
    }

    /// Create a service with default search and queue settings
    pub fn with_defaults(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
    ) -> Self {
        Self::new(
            embedder,
            index,
            &SearchConfig::default(),
            &QueueConfig::default(),
        )
    }

    /// Open the on-disk store and local embedding model described by `config`.
    ///
    /// Loads the model before returning, so the first write or search does
    /// not pay for it.
    pub async fn open(config: &Config) -> Result<Self> {
        config.validate()?;

        std::fs::create_dir_all(&config.storage.data_dir)?;
        let embedder = Arc::new(FastEmbedProvider::from_config(&config.embedding)?);
        let index = Arc::new(
            LanceIndex::open(
                &config.storage.data_dir,
                &config.storage.table_name,
                config.embedding.dimension,
            )
            .await?,
        );
        embedder.warm_up().await?;
        index.ensure_vector_index().await?;

        info!(
            data_dir = %config.storage.data_dir.display(),
            table = %config.storage.table_name,
            model = %config.embedding.model,
            "Memory service opened"
        );
        Ok(Self::new(embedder, index, &config.search, &config.queue))
    }

    /// Embed and persist a new live record.
    ///
    /// When `embedding_hint` is given it is embedded in place of `content`;
    /// `content` is still what gets stored.
    pub async fn store(
        &self,
        content: &str,
        metadata: Metadata,
        embedding_hint: Option<&str>,
    ) -> Result<MemoryRecord> {
        validate_content(content)?;

        let hint = embedding_hint.filter(|hint| !hint.trim().is_empty());
        let embed_text = hint.unwrap_or(content);
        let embedding = self.embedder.embed(embed_text).await?;
        ensure_dimension(self.index.dimension(), std::slice::from_ref(&embedding))?;

        let record = MemoryRecord::new(content.to_string(), embedding, metadata);
        self.index.insert(&record).await?;

        debug!(id = %record.id, hinted = hint.is_some(), "Memory stored");
        Ok(record)
    }

    /// Queue a memory for batched embedding and return its future id.
    ///
    /// The memory becomes readable and searchable once the queue flushes.
    pub fn enqueue(&self, content: &str, metadata: Metadata) -> Result<Uuid> {
        validate_content(content)?;
        Ok(self.queue.enqueue(content.to_string(), metadata))
    }

    /// Embed and persist everything currently queued
    pub async fn flush(&self) -> Result<usize> {
        self.queue.flush().await
    }

    /// Number of memories waiting in the embedding queue
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Literal point read. Superseded and deleted records are returned as
    /// stored.
    pub async fn get(&self, id: Uuid) -> Result<Option<MemoryRecord>> {
        self.index.get_by_id(id).await
    }

    /// Tombstone a record. Returns `false` if the id is unknown or the
    /// record is already deleted.
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let Some(record) = self.index.get_by_id(id).await? else {
            debug!(%id, "Delete of unknown memory");
            return Ok(false);
        };
        if record.is_deleted() {
            debug!(%id, "Memory already deleted");
            return Ok(false);
        }

        let updated = self
            .index
            .update_fields(id, &RecordUpdate::supersede_with(SupersededBy::Tombstone))
            .await?;
        if updated {
            info!(%id, "Memory deleted");
        }
        Ok(updated)
    }

    /// Store a replacement for `old_id` and point the old record at it.
    ///
    /// Returns `None` without storing anything when `old_id` is unknown.
    /// Only live records can be superseded, which keeps chains linear.
    pub async fn supersede(
        &self,
        old_id: Uuid,
        content: &str,
        metadata: Metadata,
        embedding_hint: Option<&str>,
    ) -> Result<Option<MemoryRecord>> {
        validate_content(content)?;

        let Some(old) = self.index.get_by_id(old_id).await? else {
            return Ok(None);
        };
        if !old.is_live() {
            return Err(StrataError::InvalidInput(format!(
                "Memory {old_id} is already superseded or deleted"
            )));
        }

        let replacement = self.store(content, metadata, embedding_hint).await?;
        self.index
            .update_fields(
                old_id,
                &RecordUpdate::supersede_with(SupersededBy::Record(replacement.id)),
            )
            .await?;

        info!(old = %old_id, new = %replacement.id, "Memory superseded");
        Ok(Some(replacement))
    }

    /// Up to `limit` distinct live records most similar to `query`
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        self.search_filtered(query, limit, &MetadataFilter::default())
            .await
    }

    /// Search keeping only live records whose metadata matches `filter`.
    ///
    /// Records the filter rejects still use up over-fetched candidates, so a
    /// narrow filter can return fewer than `limit` hits.
    pub async fn search_filtered(
        &self,
        query: &str,
        limit: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<SearchHit>> {
        if query.trim().is_empty() {
            return Err(StrataError::InvalidInput(
                "Search query must not be empty".to_string(),
            ));
        }
        if limit == 0 {
            return Ok(Vec::new());
        }

        let vector = self.embedder.embed(query).await?;
        self.search_by_embedding_filtered(&vector, limit, filter)
            .await
    }

    /// Search with the configured default limit
    pub async fn search_default(&self, query: &str) -> Result<Vec<SearchHit>> {
        self.search(query, self.default_limit).await
    }

    /// Search with a precomputed query vector
    pub async fn search_by_embedding(
        &self,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<SearchHit>> {
        self.search_by_embedding_filtered(vector, limit, &MetadataFilter::default())
            .await
    }

    pub async fn search_by_embedding_filtered(
        &self,
        vector: &[f32],
        limit: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<SearchHit>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        ensure_dimension(self.index.dimension(), &[vector.to_vec()])?;

        let started = Instant::now();
        let fetch = limit.saturating_mul(self.overfetch_factor);
        let candidates = self.index.nearest_neighbors(vector, fetch).await?;
        let candidate_count = candidates.len();

        let resolver = self.resolver();
        let mut accepted: HashSet<Uuid> = HashSet::new();
        let mut hits = Vec::with_capacity(limit);

        for candidate in candidates {
            if hits.len() >= limit {
                break;
            }

            // Vanished between the index scan and the lookup
            let Some(record) = self.index.get_by_id(candidate.id).await? else {
                continue;
            };

            let live = if record.is_live() {
                record
            } else {
                match resolver.trace_record(record).await? {
                    Resolution::Live(head) => head,
                    _ => continue,
                }
            };

            if !filter.matches(&live.metadata) {
                continue;
            }
            if accepted.insert(live.id) {
                hits.push(SearchHit {
                    memory: live,
                    distance: candidate.distance,
                    matched_id: candidate.id,
                });
            }
        }

        debug!(
            candidates = candidate_count,
            returned = hits.len(),
            limit,
            filtered = !filter.is_empty(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Search completed"
        );
        Ok(hits)
    }

    /// Resolver over this service's index
    pub fn resolver(&self) -> SupersessionResolver<'_> {
        SupersessionResolver::new(self.index.as_ref())
    }

    /// Record counts by state plus the current queue length
    pub async fn stats(&self) -> Result<MemoryStats> {
        Ok(MemoryStats {
            records: self.index.state_counts().await?,
            queued: self.queue.len(),
        })
    }

    pub fn default_limit(&self) -> usize {
        self.default_limit
    }
}

fn validate_content(content: &str) -> Result<()> {
    if content.trim().is_empty() {
        return Err(StrataError::InvalidInput(
            "Memory content must not be empty".to_string(),
        ));
    }
    Ok(())
}
