//! Deferred embedding queue
//!
//! Buffers pending memories and embeds them in batches, either on an
//! explicit `flush` or in the background once the buffer reaches its
//! threshold. A flush takes the whole buffer with a swap-and-clear before
//! its first await, so items enqueued while it runs always land in a later
//! batch. At most one flush runs at a time; a trigger that arrives while
//! one is in flight is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::embedding::{EmbeddingProvider, ensure_dimension};
use crate::error::{Result, StrataError};
use crate::memory::types::{MemoryRecord, Metadata};
use crate::storage::VectorIndex;

/// A memory waiting to be embedded.
struct PendingMemory {
    /// Id the record will be stored under
    id: Uuid,
    content: String,
    metadata: Metadata,
    enqueued_at: DateTime<Utc>,
}

struct QueueInner {
    pending: Mutex<Vec<PendingMemory>>,
    flushing: AtomicBool,
    flush_threshold: usize,
    embedder: Arc<dyn EmbeddingProvider>,
    index: Arc<dyn VectorIndex>,
}

/// Held by whichever task owns the single flush slot; releases it on drop.
struct FlushPermit {
    inner: Arc<QueueInner>,
}

impl Drop for FlushPermit {
    fn drop(&mut self) {
        self.inner.flushing.store(false, Ordering::SeqCst);
    }
}

/// Batching front-end to an embedding provider and a vector index.
///
/// Cheap to clone; clones share the same buffer.
#[derive(Clone)]
pub struct EmbeddingQueue {
    inner: Arc<QueueInner>,
}

impl EmbeddingQueue {
    pub fn new(
        embedder: Arc<dyn EmbeddingProvider>,
        index: Arc<dyn VectorIndex>,
        flush_threshold: usize,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                pending: Mutex::new(Vec::new()),
                flushing: AtomicBool::new(false),
                flush_threshold: flush_threshold.max(1),
                embedder,
                index,
            }),
        }
    }

    /// Buffer a memory for embedding and return the id it will be stored
    /// under. Never waits on the provider; the memory is not searchable
    /// until a flush persists it.
    pub fn enqueue(&self, content: String, metadata: Metadata) -> Uuid {
        let id = Uuid::new_v4();
        let len = {
            let mut pending = self.lock_pending();
            pending.push(PendingMemory {
                id,
                content,
                metadata,
                enqueued_at: Utc::now(),
            });
            pending.len()
        };

        debug!(%id, queued = len, "Memory enqueued");
        if len >= self.inner.flush_threshold {
            self.schedule_flush();
        }
        id
    }

    /// Embed and persist everything currently buffered. Returns the number
    /// of records written; zero if the buffer was empty or another flush is
    /// already running.
    ///
    /// On failure the drained batch is not requeued.
    pub async fn flush(&self) -> Result<usize> {
        match self.try_begin_flush() {
            Some(permit) => {
                let result = self.flush_with(permit).await;
                self.reschedule_if_full();
                result
            }
            None => {
                debug!("Flush already in flight, skipping");
                Ok(0)
            }
        }
    }

    /// Number of memories waiting to be embedded
    pub fn len(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.flushing.load(Ordering::SeqCst)
    }

    pub fn flush_threshold(&self) -> usize {
        self.inner.flush_threshold
    }

    fn lock_pending(&self) -> MutexGuard<'_, Vec<PendingMemory>> {
        self.inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn try_begin_flush(&self) -> Option<FlushPermit> {
        self.inner
            .flushing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| FlushPermit {
                inner: Arc::clone(&self.inner),
            })
    }

    fn schedule_flush(&self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime available; leaving queued memories for an explicit flush");
            return;
        };
        let Some(permit) = self.try_begin_flush() else {
            debug!("Auto-flush skipped, flush already in flight");
            return;
        };

        let queue = self.clone();
        handle.spawn(async move {
            match queue.flush_with(permit).await {
                Ok(count) => debug!(count, "Auto-flush completed"),
                Err(e) => error!(error = %e, "Auto-flush failed; batch dropped"),
            }
            queue.reschedule_if_full();
        });
    }

    /// Triggers skipped while a flush was running are picked up here.
    fn reschedule_if_full(&self) {
        if self.len() >= self.inner.flush_threshold {
            self.schedule_flush();
        }
    }

    async fn flush_with(&self, permit: FlushPermit) -> Result<usize> {
        let _permit = permit;

        let batch = std::mem::take(&mut *self.lock_pending());
        if batch.is_empty() {
            return Ok(0);
        }
        // Buffer order is enqueue order
        let oldest_ms = (Utc::now() - batch[0].enqueued_at).num_milliseconds();

        let texts: Vec<String> = batch.iter().map(|p| p.content.clone()).collect();
        let embeddings = self.inner.embedder.embed_batch(&texts).await?;

        if embeddings.len() != batch.len() {
            return Err(StrataError::Embedding(format!(
                "Provider returned {} embeddings for {} queued memories",
                embeddings.len(),
                batch.len()
            )));
        }
        ensure_dimension(self.inner.index.dimension(), &embeddings)?;

        let records: Vec<MemoryRecord> = batch
            .into_iter()
            .zip(embeddings)
            .map(|(pending, embedding)| {
                MemoryRecord::with_id(pending.id, pending.content, embedding, pending.metadata)
            })
            .collect();

        self.inner.index.insert_batch(&records).await?;

        info!(
            count = records.len(),
            oldest_ms,
            provider = self.inner.embedder.name(),
            "Flushed embedding queue"
        );

        // The batch is already persisted; a failed index build only costs
        // search speed.
        if let Err(e) = self.inner.index.ensure_vector_index().await {
            warn!(error = %e, "Failed to build vector index after flush");
        }
        Ok(records.len())
    }
}
