//! Versioned knowledge package wire format.
//!
//! A package is one (subject, grade) curriculum at one semantic version:
//! a manifest, an ordered chunk list with precomputed embeddings, and a
//! checksum over both. Packages are produced by the cloud ETL; the node
//! only parses, verifies, and installs them.

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::VkpError;
use crate::ports::vector::{ChunkMetadata, StoredChunk};

/// Package manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VkpManifest {
    pub subject: String,
    pub grade: String,
    pub version: Version,
    pub created_at: DateTime<Utc>,
    /// Identifier of the model that produced the chunk embeddings.
    pub embedding_model: String,
    pub chunk_size: u32,
    pub chunk_overlap: u32,
    pub total_chunks: u32,
    pub source_files: Vec<String>,
}

/// One retrieval unit: a bounded text span with its embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VkpChunk {
    pub chunk_id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    pub source_file: String,
    pub chunk_index: u32,
    pub char_start: u32,
    pub char_end: u32,
    #[serde(default)]
    pub topic: Option<String>,
}

impl VkpChunk {
    /// Convert to the vector store representation.
    pub fn to_stored(&self) -> StoredChunk {
        StoredChunk {
            chunk_id: self.chunk_id.clone(),
            text: self.text.clone(),
            embedding: self.embedding.clone(),
            metadata: ChunkMetadata {
                source_file: self.source_file.clone(),
                chunk_index: self.chunk_index,
                char_start: self.char_start,
                char_end: self.char_end,
                topic: self.topic.clone(),
            },
        }
    }
}

/// Checksum input: the document minus its checksum field, in declaration
/// order. Field order is what makes the serialization canonical.
#[derive(Serialize)]
struct ChecksumPayload<'a> {
    manifest: &'a VkpManifest,
    chunks: &'a [VkpChunk],
}

/// A complete serialized package.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VkpDocument {
    pub manifest: VkpManifest,
    pub chunks: Vec<VkpChunk>,
    /// `"sha256:" + hex` over the serialized manifest and chunks.
    pub checksum: String,
}

impl VkpDocument {
    /// Parse and structurally validate a package.
    ///
    /// Checks shape only; integrity is [`verify_checksum`] and dimension
    /// compatibility is the installer's concern.
    ///
    /// [`verify_checksum`]: VkpDocument::verify_checksum
    pub fn parse(bytes: &[u8]) -> Result<Self, VkpError> {
        let doc: VkpDocument =
            serde_json::from_slice(bytes).map_err(|e| VkpError::Parse(e.to_string()))?;

        if doc.manifest.total_chunks as usize != doc.chunks.len() {
            return Err(VkpError::Parse(format!(
                "manifest declares {} chunks, document carries {}",
                doc.manifest.total_chunks,
                doc.chunks.len()
            )));
        }
        if doc.chunks.is_empty() {
            return Err(VkpError::Parse("package has no chunks".into()));
        }
        let dim = doc.chunks[0].embedding.len();
        if dim == 0 {
            return Err(VkpError::Parse("chunk embeddings are empty".into()));
        }
        if let Some(bad) = doc.chunks.iter().find(|c| c.embedding.len() != dim) {
            return Err(VkpError::Parse(format!(
                "chunk {} has dimension {}, expected {}",
                bad.chunk_id,
                bad.embedding.len(),
                dim
            )));
        }
        Ok(doc)
    }

    /// Recompute the checksum over manifest and chunks.
    pub fn compute_checksum(&self) -> String {
        checksum_of(&self.manifest, &self.chunks)
    }

    /// Compare the declared checksum with a recomputed one.
    pub fn verify_checksum(&self) -> Result<(), VkpError> {
        let computed = self.compute_checksum();
        if computed != self.checksum {
            return Err(VkpError::ChecksumMismatch {
                declared: self.checksum.clone(),
                computed,
            });
        }
        Ok(())
    }

    /// Embedding dimension of this package's chunks.
    pub fn embedding_dimension(&self) -> usize {
        self.chunks.first().map(|c| c.embedding.len()).unwrap_or(0)
    }

    /// Build a document with its checksum filled in.
    ///
    /// The ETL-side constructor; the node uses it only to author test
    /// and demo packages.
    pub fn sealed(manifest: VkpManifest, chunks: Vec<VkpChunk>) -> Self {
        let checksum = checksum_of(&manifest, &chunks);
        Self {
            manifest,
            chunks,
            checksum,
        }
    }

    /// Serialize back to the wire format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, VkpError> {
        serde_json::to_vec(self).map_err(|e| VkpError::Parse(e.to_string()))
    }

    /// Chunks in vector-store representation.
    pub fn stored_chunks(&self) -> Vec<StoredChunk> {
        self.chunks.iter().map(VkpChunk::to_stored).collect()
    }
}

fn checksum_of(manifest: &VkpManifest, chunks: &[VkpChunk]) -> String {
    let payload = ChecksumPayload { manifest, chunks };
    // Struct serialization is deterministic: fields in declaration order.
    let bytes = serde_json::to_vec(&payload).expect("package payload serializes");
    let digest = Sha256::digest(&bytes);
    format!("sha256:{}", hex::encode(digest))
}

/// One activated package version, as tracked by the installation record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstalledVersion {
    pub version: Version,
    pub installed_at: DateTime<Utc>,
    pub chunk_count: u32,
    pub embedding_model: String,
    /// Blob key of the retained package artifact, used for rollback and
    /// for rebuilding the vector collections at boot.
    pub artifact_key: String,
}

/// Per-(subject, grade) installation state: the active version plus a
/// bounded rollback history, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VkpInstallation {
    pub subject: String,
    pub grade: String,
    pub active: InstalledVersion,
    pub history: Vec<InstalledVersion>,
}
