//! Vector store port: per-subject similarity search over curriculum chunks.
//!
//! Retrieval is read-mostly; writes happen only when the package manager
//! swaps a subject's chunk set during install or rollback. The swap is
//! atomic from a reader's point of view: a search sees either the old set
//! or the new set, never a mix.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::PortError;

/// Position and provenance metadata carried by every chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    /// Source document the chunk was extracted from.
    pub source_file: String,
    /// Index of this chunk within the source document.
    pub chunk_index: u32,
    /// Character offset from document start.
    pub char_start: u32,
    /// Character offset end (exclusive).
    pub char_end: u32,
    /// Canonical topic label, when the ETL resolved one.
    #[serde(default)]
    pub topic: Option<String>,
}

/// A chunk as stored in a subject collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredChunk {
    pub chunk_id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// A retrieval result with its similarity score.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub chunk_id: String,
    pub text: String,
    pub similarity: f32,
    pub metadata: ChunkMetadata,
}

/// Per-subject similarity search and collection management.
#[async_trait]
pub trait VectorStorePort: Send + Sync {
    /// Return the `k` most similar chunks for `subject`, best first.
    ///
    /// Deterministic given identical inputs and store state. Returns
    /// fewer than `k` results when the collection is smaller.
    async fn top_k(
        &self,
        subject: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>, PortError>;

    /// Replace the subject's chunk set wholesale.
    ///
    /// Chunks absent from `chunks` are removed; readers observe the old
    /// set until the swap completes, then the new set.
    async fn upsert_subject(
        &self,
        subject: &str,
        chunks: Vec<StoredChunk>,
    ) -> Result<(), PortError>;

    /// Drop a subject's collection entirely.
    async fn delete_subject(&self, subject: &str) -> Result<(), PortError>;

    /// Number of chunks stored for a subject (0 when absent).
    async fn chunk_count(&self, subject: &str) -> Result<usize, PortError>;

    /// All subjects with a collection, sorted.
    async fn subjects(&self) -> Result<Vec<String>, PortError>;

    /// Full contents of a subject's collection, for backups.
    async fn dump_subject(&self, subject: &str) -> Result<Vec<StoredChunk>, PortError>;

    async fn health(&self) -> Result<(), PortError>;
}

/// Cosine similarity; 0.0 when either vector has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// In-process vector store over immutable per-subject snapshots.
///
/// Each subject maps to an `Arc<Vec<StoredChunk>>`; a search clones the
/// Arc under a read lock and scores against that snapshot, so an install
/// swapping the map entry never produces a mixed view. Collections are
/// rebuilt from retained package artifacts at boot.
#[derive(Default)]
pub struct MemoryVectorStore {
    collections: RwLock<HashMap<String, Arc<Vec<StoredChunk>>>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self, subject: &str) -> Option<Arc<Vec<StoredChunk>>> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        collections.get(subject).cloned()
    }
}

#[async_trait]
impl VectorStorePort for MemoryVectorStore {
    async fn top_k(
        &self,
        subject: &str,
        query: &[f32],
        k: usize,
    ) -> Result<Vec<ScoredChunk>, PortError> {
        let Some(chunks) = self.snapshot(subject) else {
            return Ok(Vec::new());
        };
        if let Some(first) = chunks.first() {
            if first.embedding.len() != query.len() {
                return Err(PortError::MalformedInput {
                    port: "vector_store",
                    reason: format!(
                        "query dimension {} does not match collection dimension {}",
                        query.len(),
                        first.embedding.len()
                    ),
                });
            }
        }

        let mut scored: Vec<ScoredChunk> = chunks
            .iter()
            .map(|c| ScoredChunk {
                chunk_id: c.chunk_id.clone(),
                text: c.text.clone(),
                similarity: cosine_similarity(&c.embedding, query),
                metadata: c.metadata.clone(),
            })
            .collect();
        // Descending similarity, chunk id as a deterministic tie-break.
        scored.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        scored.truncate(k);
        Ok(scored)
    }

    async fn upsert_subject(
        &self,
        subject: &str,
        chunks: Vec<StoredChunk>,
    ) -> Result<(), PortError> {
        let snapshot = Arc::new(chunks);
        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        collections.insert(subject.to_string(), snapshot);
        Ok(())
    }

    async fn delete_subject(&self, subject: &str) -> Result<(), PortError> {
        let mut collections = self.collections.write().unwrap_or_else(|e| e.into_inner());
        collections.remove(subject);
        Ok(())
    }

    async fn chunk_count(&self, subject: &str) -> Result<usize, PortError> {
        Ok(self.snapshot(subject).map(|c| c.len()).unwrap_or(0))
    }

    async fn subjects(&self) -> Result<Vec<String>, PortError> {
        let collections = self.collections.read().unwrap_or_else(|e| e.into_inner());
        let mut subjects: Vec<String> = collections.keys().cloned().collect();
        subjects.sort();
        Ok(subjects)
    }

    async fn dump_subject(&self, subject: &str) -> Result<Vec<StoredChunk>, PortError> {
        Ok(self
            .snapshot(subject)
            .map(|c| c.as_ref().clone())
            .unwrap_or_default())
    }

    async fn health(&self) -> Result<(), PortError> {
        Ok(())
    }
}
