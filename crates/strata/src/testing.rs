//! Test utilities for strata
//!
//! Mock embedding provider for fast tests that don't need a real model.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::Semaphore;

use crate::embedding::{EMBEDDING_DIMENSION, EmbeddingProvider};
use crate::error::{Result, StrataError};

#[derive(Default)]
struct GateState {
    closed: bool,
    /// Calls parked and not yet handed a permit
    waiting: usize,
}

/// Mock embedding provider producing deterministic vectors from a hash of
/// the input text.
///
/// Tests can pin exact vectors for given texts, count calls, inject
/// failures, and park batch calls behind a gate.
pub struct MockEmbeddingProvider {
    dimension: usize,
    overrides: DashMap<String, Vec<f32>>,
    embed_calls: AtomicUsize,
    batch_calls: AtomicUsize,
    embedded: Mutex<Vec<String>>,
    batch_sizes: Mutex<Vec<usize>>,
    failing: AtomicBool,
    gate_state: Mutex<GateState>,
    gate: Semaphore,
    parked: AtomicUsize,
}

impl Default for MockEmbeddingProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEmbeddingProvider {
    /// 384-dim vectors, matching the default model
    pub fn new() -> Self {
        Self::with_dimension(EMBEDDING_DIMENSION)
    }

    pub fn with_dimension(dimension: usize) -> Self {
        Self {
            dimension,
            overrides: DashMap::new(),
            embed_calls: AtomicUsize::new(0),
            batch_calls: AtomicUsize::new(0),
            embedded: Mutex::new(Vec::new()),
            batch_sizes: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
            gate_state: Mutex::new(GateState::default()),
            gate: Semaphore::new(0),
            parked: AtomicUsize::new(0),
        }
    }

    /// Return `vector` whenever `text` is embedded.
    pub fn set_vector(&self, text: &str, vector: Vec<f32>) {
        self.overrides.insert(text.to_string(), vector);
    }

    /// Make every subsequent call fail with an `Embedding` error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Park every subsequent `embed_batch` call until `release` is called.
    pub fn close_gate(&self) {
        self.lock_gate().closed = true;
    }

    /// Reopen the gate and let every parked batch call through.
    ///
    /// Permits are only issued for calls already parked, so a release with
    /// nothing parked cannot leak past a later `close_gate`.
    pub fn release(&self) {
        let mut state = self.lock_gate();
        state.closed = false;
        self.gate.add_permits(std::mem::take(&mut state.waiting));
    }

    /// Batch calls that have reached the gate, whether or not released yet.
    pub fn parked(&self) -> usize {
        self.parked.load(Ordering::SeqCst)
    }

    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    pub fn batch_calls(&self) -> usize {
        self.batch_calls.load(Ordering::SeqCst)
    }

    /// Every text handed to the provider, in call order.
    pub fn embedded_texts(&self) -> Vec<String> {
        self.embedded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Input length of each `embed_batch` call, in call order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The vector this provider returns for `text`.
    pub fn vector_for(&self, text: &str) -> Vec<f32> {
        if let Some(vector) = self.overrides.get(text) {
            return vector.clone();
        }

        let mut hasher = DefaultHasher::new();
        text.hash(&mut hasher);
        let seed = hasher.finish();

        (0..self.dimension)
            .map(|i| {
                let x = seed
                    .wrapping_mul(i as u64 + 1)
                    .wrapping_add(0x9e3779b97f4a7c15);
                let normalized = (x as f32) / (u64::MAX as f32);
                (normalized * 2.0) - 1.0
            })
            .collect()
    }

    fn lock_gate(&self) -> MutexGuard<'_, GateState> {
        self.gate_state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_failing(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StrataError::Embedding(
                "Mock provider configured to fail".to_string(),
            ));
        }
        Ok(())
    }

    fn record(&self, text: &str) {
        self.embedded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(text.to_string());
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        self.check_failing()?;
        self.record(text);
        Ok(self.vector_for(text))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(texts.len());

        let park = {
            let mut state = self.lock_gate();
            if state.closed {
                state.waiting += 1;
            }
            state.closed
        };
        if park {
            self.parked.fetch_add(1, Ordering::SeqCst);
            let permit = self
                .gate
                .acquire()
                .await
                .map_err(|e| StrataError::Embedding(format!("Mock gate closed: {e}")))?;
            permit.forget();
        }

        self.check_failing()?;
        for text in texts {
            self.record(text);
        }
        Ok(texts.iter().map(|t| self.vector_for(t)).collect())
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}
