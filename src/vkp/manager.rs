//! Curriculum package install and rollback.
//!
//! State machine per (subject, grade): parse → checksum → dimension
//! check → atomic vector swap → installation record → cache purge.
//! Installs for one (subject, grade) are serialized by a per-key async
//! mutex; different subjects install in parallel. Readers never block:
//! active versions are snapshots behind a briefly-held lock, and the
//! vector store swaps whole collections.
//!
//! Every activated version's artifact is retained in the local blob
//! staging area while it sits in the bounded rollback history, so a
//! rollback restores the exact chunk set that was live before.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use semver::Version;
use tokio::sync::Mutex as AsyncMutex;

use crate::cache::{subject_prefix, ResponseCache};
use crate::error::VkpError;
use crate::ports::{
    BlobStorePort, ClockPort, EmbedderPort, RelationalStorePort, SubjectRecord, VectorStorePort,
};
use crate::vkp::{InstalledVersion, VkpDocument, VkpInstallation};

/// Blob key for a retained package artifact.
fn artifact_key(subject: &str, grade: &str, version: &Version) -> String {
    format!("vkp/packages/{subject}/{grade}/{version}.vkp")
}

type SubjectGrade = (String, String);

/// Configuration for the package manager.
#[derive(Debug, Clone)]
pub struct VkpManagerConfig {
    /// Prior versions retained for rollback.
    pub history_depth: usize,
}

impl Default for VkpManagerConfig {
    fn default() -> Self {
        Self { history_depth: 3 }
    }
}

/// Installs, rolls back, and answers active-version queries.
pub struct VkpManager {
    vector: Arc<dyn VectorStorePort>,
    relational: Arc<dyn RelationalStorePort>,
    cache: Arc<ResponseCache>,
    artifacts: Arc<dyn BlobStorePort>,
    embedder: Arc<dyn EmbedderPort>,
    clock: Arc<dyn ClockPort>,
    /// Active installation state. Reads clone small records under a
    /// briefly-held lock; writes happen only post-swap.
    state: RwLock<HashMap<SubjectGrade, VkpInstallation>>,
    /// Per-(subject, grade) install serialization.
    install_locks: Mutex<HashMap<SubjectGrade, Arc<AsyncMutex<()>>>>,
    history_depth: usize,
}

impl VkpManager {
    pub fn new(
        vector: Arc<dyn VectorStorePort>,
        relational: Arc<dyn RelationalStorePort>,
        cache: Arc<ResponseCache>,
        artifacts: Arc<dyn BlobStorePort>,
        embedder: Arc<dyn EmbedderPort>,
        clock: Arc<dyn ClockPort>,
        config: VkpManagerConfig,
    ) -> Self {
        Self {
            vector,
            relational,
            cache,
            artifacts,
            embedder,
            clock,
            state: RwLock::new(HashMap::new()),
            install_locks: Mutex::new(HashMap::new()),
            history_depth: config.history_depth.max(1),
        }
    }

    fn lock_for(&self, key: &SubjectGrade) -> Arc<AsyncMutex<()>> {
        let mut locks = self.install_locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(key.clone()).or_default())
    }

    /// Rehydrate installation state and vector collections at boot.
    ///
    /// Vectors live in memory and are rebuilt from retained artifacts; a
    /// missing or corrupt artifact degrades that subject to empty
    /// retrieval until the next successful pull, it does not fail boot.
    pub async fn restore_from_store(&self) -> Result<usize, VkpError> {
        let installations = self.relational.list_installations().await?;
        let mut restored = 0;
        for installation in installations {
            let key = (installation.subject.clone(), installation.grade.clone());
            match self.artifacts.get(&installation.active.artifact_key).await {
                Ok((bytes, _etag)) => match VkpDocument::parse(&bytes) {
                    Ok(doc) => {
                        self.vector
                            .upsert_subject(&installation.subject, doc.stored_chunks())
                            .await?;
                        restored += 1;
                    }
                    Err(err) => {
                        tracing::warn!(
                            subject = %installation.subject,
                            grade = %installation.grade,
                            error = %err,
                            "retained package artifact is corrupt, subject starts empty"
                        );
                    }
                },
                Err(err) => {
                    tracing::warn!(
                        subject = %installation.subject,
                        grade = %installation.grade,
                        error = %err,
                        "retained package artifact missing, subject starts empty"
                    );
                }
            }
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            state.insert(key, installation);
        }
        Ok(restored)
    }

    /// Active version for a subject, independent of grade.
    ///
    /// With several grades installed for one subject the most recent
    /// install wins; retrieval and cache keys are per subject.
    pub fn active_version(&self, subject: &str) -> Option<Version> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .values()
            .filter(|i| i.subject == subject)
            .max_by_key(|i| i.active.installed_at)
            .map(|i| i.active.version.clone())
    }

    /// Active version for an exact (subject, grade).
    pub fn active_version_for(&self, subject: &str, grade: &str) -> Option<Version> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        state
            .get(&(subject.to_string(), grade.to_string()))
            .map(|i| i.active.version.clone())
    }

    /// Snapshot of all installations, sorted by (subject, grade).
    pub fn installations(&self) -> Vec<VkpInstallation> {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<VkpInstallation> = state.values().cloned().collect();
        all.sort_by(|a, b| (&a.subject, &a.grade).cmp(&(&b.subject, &b.grade)));
        all
    }

    /// Verify and activate a candidate package.
    ///
    /// A rejected package (checksum, dimension, parse) leaves every bit
    /// of prior state in place.
    pub async fn install(
        &self,
        subject: &str,
        grade: &str,
        bytes: &[u8],
    ) -> Result<Version, VkpError> {
        let key = (subject.to_string(), grade.to_string());
        let guard = self.lock_for(&key);
        let _serialized = guard.lock().await;

        let doc = VkpDocument::parse(bytes)?;
        if doc.manifest.subject != subject || doc.manifest.grade != grade {
            return Err(VkpError::Parse(format!(
                "manifest addresses ({}, {}), install requested ({subject}, {grade})",
                doc.manifest.subject, doc.manifest.grade
            )));
        }
        doc.verify_checksum()?;

        let expected = self.embedder.dimension();
        let found = doc.embedding_dimension();
        if found != expected {
            return Err(VkpError::IncompatibleEmbedding { expected, found });
        }

        let version = doc.manifest.version.clone();
        let new_key = artifact_key(subject, grade, &version);
        self.artifacts.put(&new_key, bytes).await?;

        // Swap the live chunk set; readers see old or new, never mixed.
        self.vector
            .upsert_subject(subject, doc.stored_chunks())
            .await?;

        let installed = InstalledVersion {
            version: version.clone(),
            installed_at: self.clock.now(),
            chunk_count: doc.manifest.total_chunks,
            embedding_model: doc.manifest.embedding_model.clone(),
            artifact_key: new_key.clone(),
        };

        let (installation, dropped_artifacts) = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let mut dropped = Vec::new();
            let installation = match state.entry(key.clone()) {
                Entry::Occupied(mut occupied) => {
                    let existing = occupied.get_mut();
                    if existing.active.version != version {
                        existing.history.insert(0, existing.active.clone());
                        while existing.history.len() > self.history_depth {
                            let evicted = existing.history.pop().expect("len checked");
                            dropped.push(evicted.artifact_key);
                        }
                    }
                    existing.active = installed;
                    existing.clone()
                }
                Entry::Vacant(vacant) => vacant
                    .insert(VkpInstallation {
                        subject: subject.to_string(),
                        grade: grade.to_string(),
                        active: installed,
                        history: Vec::new(),
                    })
                    .clone(),
            };
            (installation, dropped)
        };

        self.relational.put_installation(&installation).await?;
        self.register_subject(subject).await?;
        self.prune_artifacts(&installation, dropped_artifacts).await;

        let purged = self.cache.invalidate(&subject_prefix(subject)).await;
        tracing::info!(
            subject,
            grade,
            version = %version,
            chunks = installation.active.chunk_count,
            cache_purged = purged,
            "curriculum package activated"
        );
        Ok(version)
    }

    /// Revert to the most recent history entry.
    pub async fn rollback(&self, subject: &str, grade: &str) -> Result<Version, VkpError> {
        let key = (subject.to_string(), grade.to_string());
        let guard = self.lock_for(&key);
        let _serialized = guard.lock().await;

        let (target, replaced) = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            let installation = state.get(&key).ok_or_else(|| VkpError::NoRollbackTarget {
                subject: subject.to_string(),
                grade: grade.to_string(),
            })?;
            let target = installation
                .history
                .first()
                .cloned()
                .ok_or_else(|| VkpError::NoRollbackTarget {
                    subject: subject.to_string(),
                    grade: grade.to_string(),
                })?;
            (target, installation.active.clone())
        };

        let (bytes, _etag) = self.artifacts.get(&target.artifact_key).await?;
        let doc = VkpDocument::parse(&bytes)?;
        self.vector
            .upsert_subject(subject, doc.stored_chunks())
            .await?;

        let installation = {
            let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
            let installation = state.get_mut(&key).expect("present above");
            installation.history.remove(0);
            installation.active = target.clone();
            installation.clone()
        };

        self.relational.put_installation(&installation).await?;
        // The version rolled back from is distrusted; drop its artifact.
        self.prune_artifacts(&installation, vec![replaced.artifact_key])
            .await;

        let purged = self.cache.invalidate(&subject_prefix(subject)).await;
        tracing::info!(
            subject,
            grade,
            version = %target.version,
            cache_purged = purged,
            "rolled back curriculum package"
        );
        Ok(target.version)
    }

    /// Make sure the subject directory knows about an installed subject.
    async fn register_subject(&self, subject: &str) -> Result<(), VkpError> {
        if self.relational.get_subject(subject).await?.is_none() {
            self.relational
                .upsert_subject(&SubjectRecord {
                    subject_id: subject.to_string(),
                    name: subject.to_string(),
                    created_at: self.clock.now(),
                })
                .await?;
        }
        Ok(())
    }

    /// Delete artifacts no longer referenced by active or history.
    async fn prune_artifacts(&self, installation: &VkpInstallation, candidates: Vec<String>) {
        for candidate in candidates {
            let referenced = installation.active.artifact_key == candidate
                || installation
                    .history
                    .iter()
                    .any(|v| v.artifact_key == candidate);
            if referenced {
                continue;
            }
            if let Err(err) = self.artifacts.delete(&candidate).await {
                tracing::warn!(artifact = %candidate, error = %err, "failed to prune package artifact");
            }
        }
    }
}
