//! Blob store port: flat keyed byte storage.
//!
//! Used by the curriculum puller (package download), the telemetry
//! pipeline (upload queue and push), and the backup scheduler. Keys are
//! `/`-separated paths under a logical root; listing is by prefix.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::PortError;

/// Keyed byte storage with prefix listing.
#[async_trait]
pub trait BlobStorePort: Send + Sync {
    /// List all keys starting with `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, PortError>;

    /// Fetch a blob and its etag (content hash).
    async fn get(&self, key: &str) -> Result<(Vec<u8>, String), PortError>;

    /// Store a blob, replacing any existing value.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), PortError>;

    /// Remove a blob. Removing a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), PortError>;

    /// Backend name for logs and stats.
    fn name(&self) -> &'static str;
}

fn etag_for(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..16])
}

/// Reject traversal and absolute keys before touching the filesystem.
fn validate_key(key: &str) -> Result<(), PortError> {
    if key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..")
    {
        return Err(PortError::MalformedInput {
            port: "blob_store",
            reason: format!("invalid blob key {key:?}"),
        });
    }
    Ok(())
}

/// Blob store over a local directory tree.
///
/// Keys map directly to relative paths under the root. This is the
/// node-local backend for package staging, the telemetry queue, and
/// backups; a deployment's cloud sync agent mounts the same contract for
/// the remote side.
pub struct LocalDirBlobStore {
    root: PathBuf,
}

impl LocalDirBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    /// Directory backing this store, for bootstrap logging.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Walk the tree under `dir`, collecting keys relative to the root.
    async fn collect_keys(&self, prefix: &str) -> Result<Vec<String>, PortError> {
        let mut keys = Vec::new();
        let mut pending: Vec<PathBuf> = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(e) => e,
                // A missing root just means nothing has been stored yet.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                } else if let Ok(rel) = path.strip_prefix(&self.root) {
                    let key = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl BlobStorePort for LocalDirBlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, PortError> {
        self.collect_keys(prefix).await
    }

    async fn get(&self, key: &str) -> Result<(Vec<u8>, String), PortError> {
        validate_key(key)?;
        let path = self.path_for(key);
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                PortError::Storage(format!("blob not found: {key}"))
            } else {
                PortError::Io(e)
            }
        })?;
        let etag = etag_for(&bytes);
        Ok((bytes, etag))
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), PortError> {
        validate_key(key)?;
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), PortError> {
        validate_key(key)?;
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &'static str {
        "local_dir"
    }
}

impl std::fmt::Debug for LocalDirBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalDirBlobStore")
            .field("root", &self.root)
            .finish()
    }
}

/// In-memory blob store for tests and the simulated remote side.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl BlobStorePort for MemoryBlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>, PortError> {
        let blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(blobs
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get(&self, key: &str) -> Result<(Vec<u8>, String), PortError> {
        let blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        match blobs.get(key) {
            Some(bytes) => Ok((bytes.clone(), etag_for(bytes))),
            None => Err(PortError::Storage(format!("blob not found: {key}"))),
        }
    }

    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), PortError> {
        validate_key(key)?;
        let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), PortError> {
        let mut blobs = self.blobs.lock().unwrap_or_else(|e| e.into_inner());
        blobs.remove(key);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
