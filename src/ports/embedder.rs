//! Embedding port for query-side vectors.
//!
//! Document-side embeddings are precomputed in the cloud ETL and arrive
//! inside curriculum packages; the node only embeds incoming questions.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::PortError;

/// Query-side text embedding.
#[async_trait]
pub trait EmbedderPort: Send + Sync {
    /// Output vector dimension.
    fn dimension(&self) -> usize;

    /// Model identifier, compared against package manifests.
    fn model_name(&self) -> &str;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, PortError>;

    /// Embed multiple texts.
    ///
    /// Default implementation calls `embed` for each text.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, PortError> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    async fn health(&self) -> Result<(), PortError>;
}

/// Deterministic local embedder built on token hashing.
///
/// Each lowercased whitespace token is hashed into a handful of vector
/// positions and the result is L2-normalized. Not a semantic model, but
/// fully offline, deterministic, and dimension-compatible with any
/// package produced by the same scheme. It is the fallback target when
/// the real embedding backend is down, and the embedder used in tests.
pub struct HashEmbedder {
    dimension: usize,
}

impl HashEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl EmbedderPort for HashEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        "hash-v1"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, PortError> {
        let mut vector = vec![0.0f32; self.dimension];
        for token in text.to_lowercase().split_whitespace() {
            let digest = Sha256::digest(token.as_bytes());
            // Four positions per token, signed by the following byte.
            for pair in digest.chunks_exact(8).take(4) {
                let idx = u32::from_le_bytes([pair[0], pair[1], pair[2], pair[3]]) as usize
                    % self.dimension;
                let sign = if pair[4] & 1 == 0 { 1.0 } else { -1.0 };
                vector[idx] += sign;
            }
        }
        let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    async fn health(&self) -> Result<(), PortError> {
        Ok(())
    }
}

/// Embedder that falls back to a local implementation when the primary
/// backend fails.
///
/// Both embedders must share a dimension, otherwise retrieval against
/// existing collections would silently break. The first failover per
/// outage is logged at warn; recovery resets the flag.
pub struct FailoverEmbedder {
    primary: Arc<dyn EmbedderPort>,
    fallback: Arc<dyn EmbedderPort>,
    outage_logged: AtomicBool,
}

impl FailoverEmbedder {
    pub fn new(
        primary: Arc<dyn EmbedderPort>,
        fallback: Arc<dyn EmbedderPort>,
    ) -> Result<Self, PortError> {
        if primary.dimension() != fallback.dimension() {
            return Err(PortError::MalformedInput {
                port: "embedder",
                reason: format!(
                    "failover dimension mismatch: primary {} vs fallback {}",
                    primary.dimension(),
                    fallback.dimension()
                ),
            });
        }
        Ok(Self {
            primary,
            fallback,
            outage_logged: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl EmbedderPort for FailoverEmbedder {
    fn dimension(&self) -> usize {
        self.primary.dimension()
    }

    fn model_name(&self) -> &str {
        self.primary.model_name()
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, PortError> {
        match self.primary.embed(text).await {
            Ok(vector) => {
                self.outage_logged.store(false, Ordering::Relaxed);
                Ok(vector)
            }
            Err(err) => {
                if !self.outage_logged.swap(true, Ordering::Relaxed) {
                    tracing::warn!(
                        error = %err,
                        fallback = self.fallback.model_name(),
                        "primary embedder failed, switching to local fallback"
                    );
                }
                self.fallback.embed(text).await
            }
        }
    }

    async fn health(&self) -> Result<(), PortError> {
        // The pair is healthy if either side is.
        if self.primary.health().await.is_ok() {
            return Ok(());
        }
        self.fallback.health().await
    }
}
