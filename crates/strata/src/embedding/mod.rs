//! Text-to-vector embedding providers
//!
//! The memory service only sees the `EmbeddingProvider` trait; the
//! fastembed-backed provider is the default production implementation.

pub mod local;

use async_trait::async_trait;

use crate::error::{Result, StrataError};

pub use local::FastEmbedProvider;

/// Dimension of the default embedding model (multilingual-e5-small)
pub const EMBEDDING_DIMENSION: usize = 384;

/// Converts text into fixed-width vectors.
///
/// Repeated calls on identical text must return vectors that rank
/// consistently under nearest-neighbor search.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts, returning one vector per input in input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut embeddings = Vec::with_capacity(texts.len());
        for text in texts {
            embeddings.push(self.embed(text).await?);
        }
        Ok(embeddings)
    }

    /// Width of every vector this provider returns
    fn dimension(&self) -> usize;

    /// Provider name for logging
    fn name(&self) -> &'static str;

    /// Pay any one-time initialization cost ahead of the first request.
    async fn warm_up(&self) -> Result<()> {
        Ok(())
    }
}

/// Fail unless every vector has the expected width.
pub(crate) fn ensure_dimension(expected: usize, embeddings: &[Vec<f32>]) -> Result<()> {
    if let Some(bad) = embeddings.iter().find(|e| e.len() != expected) {
        return Err(StrataError::Embedding(format!(
            "Embedding dimension mismatch: expected {expected}, got {}",
            bad.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Constant;

    #[async_trait]
    impl EmbeddingProvider for Constant {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(vec![text.len() as f32, 1.0])
        }

        fn dimension(&self) -> usize {
            2
        }

        fn name(&self) -> &'static str {
            "constant"
        }
    }

    #[tokio::test]
    async fn test_default_batch_preserves_order() {
        let texts = vec!["a".to_string(), "abc".to_string(), "ab".to_string()];
        let embeddings = Constant.embed_batch(&texts).await.unwrap();

        let lengths: Vec<f32> = embeddings.iter().map(|e| e[0]).collect();
        assert_eq!(lengths, vec![1.0, 3.0, 2.0]);
    }

    #[tokio::test]
    async fn test_default_warm_up_is_noop() {
        assert!(Constant.warm_up().await.is_ok());
    }

    #[test]
    fn test_ensure_dimension() {
        assert!(ensure_dimension(2, &[vec![0.0, 1.0]]).is_ok());
        assert!(ensure_dimension(2, &[]).is_ok());
        assert!(matches!(
            ensure_dimension(2, &[vec![0.0, 1.0], vec![0.0]]),
            Err(StrataError::Embedding(_))
        ));
    }
}
