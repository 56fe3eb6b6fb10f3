use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Result, StrataError};

/// Main configuration structure for Strata
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// Where and how memories are persisted
    #[serde(default)]
    pub storage: StorageConfig,
    /// Embedding model configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    /// Similarity search tuning
    #[serde(default)]
    pub search: SearchConfig,
    /// Deferred embedding queue tuning
    #[serde(default)]
    pub queue: QueueConfig,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Base directory for the LanceDB dataset
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Name of the memories table inside the dataset
    #[serde(default = "default_table_name")]
    pub table_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            table_name: default_table_name(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".strata"))
        .unwrap_or_else(|| PathBuf::from(".strata"))
}

fn default_table_name() -> String {
    "memories".to_string()
}

/// Embedding model configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    /// Model name understood by the fastembed provider
    #[serde(default = "default_embedding_model")]
    pub model: String,
    /// Embedding dimension; must match the model and the stored table
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,
    /// Batch size handed to the model during batched embedding
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,
    /// Directory for downloaded model files (fastembed default when unset)
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            batch_size: default_embedding_batch_size(),
            cache_dir: None,
        }
    }
}

fn default_embedding_model() -> String {
    "multilingual-e5-small".to_string()
}

fn default_embedding_dimension() -> usize {
    384
}

fn default_embedding_batch_size() -> usize {
    32
}

/// Similarity search configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    /// Multiplier applied to `limit` when fetching nearest-neighbor candidates
    #[serde(default = "default_overfetch_factor")]
    pub overfetch_factor: usize,
    /// Result count used by callers that do not pass an explicit limit
    #[serde(default = "default_search_limit")]
    pub default_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            overfetch_factor: default_overfetch_factor(),
            default_limit: default_search_limit(),
        }
    }
}

fn default_overfetch_factor() -> usize {
    3
}

fn default_search_limit() -> usize {
    10
}

/// Embedding queue configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Buffer length at which a background flush is triggered
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            flush_threshold: default_flush_threshold(),
        }
    }
}

fn default_flush_threshold() -> usize {
    10
}

impl Config {
    /// Parse a configuration from TOML text. Missing sections and fields
    /// fall back to their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| StrataError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file from an explicit path.
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!("Loading config from: {}", path.display());
        let content = std::fs::read_to_string(path).map_err(|e| {
            StrataError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Load from `path` when given, otherwise from the first default
    /// location that exists, otherwise return defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        let default_paths = [
            dirs::home_dir().map(|h| h.join(".strata").join("config.toml")),
            dirs::config_dir().map(|c| c.join("strata").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        for candidate in default_paths.iter().flatten() {
            if candidate.exists() {
                return Self::load(candidate);
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Config::default())
    }

    /// Reject values that would make the store misbehave rather than fail.
    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimension == 0 {
            return Err(StrataError::Config(
                "embedding.dimension must be greater than zero".to_string(),
            ));
        }
        if self.embedding.batch_size == 0 {
            return Err(StrataError::Config(
                "embedding.batch_size must be greater than zero".to_string(),
            ));
        }
        if self.search.overfetch_factor == 0 {
            return Err(StrataError::Config(
                "search.overfetch_factor must be at least 1".to_string(),
            ));
        }
        if self.queue.flush_threshold == 0 {
            return Err(StrataError::Config(
                "queue.flush_threshold must be at least 1".to_string(),
            ));
        }
        if self.storage.table_name.trim().is_empty() {
            return Err(StrataError::Config(
                "storage.table_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}
