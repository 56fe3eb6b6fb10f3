//! Local ONNX embeddings through fastembed.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fastembed::{EmbeddingModel as FastEmbedModel, InitOptions, TextEmbedding};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::config::EmbeddingConfig;
use crate::embedding::{EmbeddingProvider, ensure_dimension};
use crate::error::{Result, StrataError};

/// Resolve a model name to the fastembed model and its native dimension.
pub fn model_from_name(name: &str) -> Result<(FastEmbedModel, usize)> {
    let resolved = match name {
        "multilingual-e5-small" | "MultilingualE5Small" => (FastEmbedModel::MultilingualE5Small, 384),
        "multilingual-e5-base" | "MultilingualE5Base" => (FastEmbedModel::MultilingualE5Base, 768),
        "multilingual-e5-large" | "MultilingualE5Large" => {
            (FastEmbedModel::MultilingualE5Large, 1024)
        }
        "all-MiniLM-L6-v2" | "AllMiniLML6V2" => (FastEmbedModel::AllMiniLML6V2, 384),
        "all-MiniLM-L12-v2" | "AllMiniLML12V2" => (FastEmbedModel::AllMiniLML12V2, 384),
        "bge-small-en-v1.5" | "BGESmallENV15" => (FastEmbedModel::BGESmallENV15, 384),
        "bge-base-en-v1.5" | "BGEBaseENV15" => (FastEmbedModel::BGEBaseENV15, 768),
        "bge-large-en-v1.5" | "BGELargeENV15" => (FastEmbedModel::BGELargeENV15, 1024),
        "nomic-embed-text-v1.5" | "NomicEmbedTextV15" => (FastEmbedModel::NomicEmbedTextV15, 768),
        _ => {
            return Err(StrataError::Config(format!(
                "Unknown embedding model: '{name}'"
            )));
        }
    };
    Ok(resolved)
}

/// Embedding provider running a fastembed model in-process.
///
/// The model is loaded on first use (or on `warm_up`) and shared by every
/// later call. Inference runs on the blocking thread pool.
pub struct FastEmbedProvider {
    model_name: FastEmbedModel,
    dimension: usize,
    batch_size: usize,
    cache_dir: Option<PathBuf>,
    model: OnceCell<Arc<Mutex<TextEmbedding>>>,
}

impl FastEmbedProvider {
    pub fn new(model_name: FastEmbedModel, dimension: usize) -> Self {
        Self {
            model_name,
            dimension,
            batch_size: 32,
            cache_dir: None,
            model: OnceCell::new(),
        }
    }

    /// Build from configuration, refusing a dimension the model does not
    /// produce.
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self> {
        let (model_name, native_dimension) = model_from_name(&config.model)?;
        if native_dimension != config.dimension {
            return Err(StrataError::Config(format!(
                "Dimension mismatch: model '{}' produces {}-dim vectors but config specifies {}",
                config.model, native_dimension, config.dimension
            )));
        }

        Ok(Self {
            model_name,
            dimension: native_dimension,
            batch_size: config.batch_size,
            cache_dir: config.cache_dir.clone(),
            model: OnceCell::new(),
        })
    }

    async fn model(&self) -> Result<Arc<Mutex<TextEmbedding>>> {
        self.model
            .get_or_try_init(|| async {
                info!(model = ?self.model_name, "Initializing embedding model");

                let mut options = InitOptions::new(self.model_name.clone());
                if let Some(dir) = &self.cache_dir {
                    options = options.with_cache_dir(dir.clone());
                }

                let model = tokio::task::spawn_blocking(move || TextEmbedding::try_new(options))
                    .await
                    .map_err(|e| StrataError::Embedding(format!("Model loading task failed: {e}")))?
                    .map_err(|e| StrataError::Embedding(e.to_string()))?;

                info!(
                    model = ?self.model_name,
                    dimension = self.dimension,
                    "Embedding model initialized"
                );
                Ok(Arc::new(Mutex::new(model)))
            })
            .await
            .cloned()
    }

    async fn run(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let model = self.model().await?;
        let batch_size = self.batch_size;
        let count = texts.len();

        let embeddings = tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| StrataError::Embedding("Embedding model lock poisoned".to_string()))?;
            model
                .embed(texts, Some(batch_size))
                .map_err(|e| StrataError::Embedding(e.to_string()))
        })
        .await
        .map_err(|e| StrataError::Embedding(format!("Embedding task failed: {e}")))??;

        if embeddings.len() != count {
            return Err(StrataError::Embedding(format!(
                "Model returned {} embeddings for {count} inputs",
                embeddings.len()
            )));
        }
        ensure_dimension(self.dimension, &embeddings)?;
        debug!(count, "Generated embeddings");
        Ok(embeddings)
    }
}

#[async_trait]
impl EmbeddingProvider for FastEmbedProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.run(vec![text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| StrataError::Embedding("No embedding returned".to_string()))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.run(texts.to_vec()).await
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn name(&self) -> &'static str {
        "fastembed"
    }

    async fn warm_up(&self) -> Result<()> {
        self.model().await.map(|_| ())
    }
}
