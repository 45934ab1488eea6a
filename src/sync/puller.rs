//! Periodic curriculum discovery and download.
//!
//! On each tick the remote blob store is listed under `vkp/`; for every
//! (subject, grade) the highest advertised semantic version is compared
//! to the locally active one, and strictly newer packages are downloaded
//! and handed to the package manager. The puller never touches the
//! vector store itself.
//!
//! Failures are logged and retried on the next tick; the tick rate is
//! the backoff. A tick without network is a no-op.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use semver::Version;
use tokio_util::sync::CancellationToken;

use crate::ports::BlobStorePort;
use crate::telemetry::TelemetryRecorder;
use crate::vkp::VkpManager;

/// Remote prefix advertising curriculum packages.
const REMOTE_PREFIX: &str = "vkp/";

/// Parse `vkp/<subject>/<grade>/<version>.vkp`.
fn parse_remote_key(key: &str) -> Option<(String, String, Version)> {
    let rest = key.strip_prefix(REMOTE_PREFIX)?;
    let mut parts = rest.split('/');
    let subject = parts.next()?;
    let grade = parts.next()?;
    let file = parts.next()?;
    if parts.next().is_some() || subject.is_empty() || grade.is_empty() {
        return None;
    }
    let version = file.strip_suffix(".vkp")?.parse().ok()?;
    Some((subject.to_string(), grade.to_string(), version))
}

/// Pulls newer curriculum packages from the cloud blob store.
pub struct CurriculumPuller {
    remote: Arc<dyn BlobStorePort>,
    manager: Arc<VkpManager>,
    recorder: Arc<TelemetryRecorder>,
}

impl CurriculumPuller {
    pub fn new(
        remote: Arc<dyn BlobStorePort>,
        manager: Arc<VkpManager>,
        recorder: Arc<TelemetryRecorder>,
    ) -> Self {
        Self {
            remote,
            manager,
            recorder,
        }
    }

    /// One discovery pass. Returns how many packages were applied.
    pub async fn tick(&self) -> usize {
        self.recorder.note_pull_check();

        let keys = match self.remote.list(REMOTE_PREFIX).await {
            Ok(keys) => keys,
            Err(err) => {
                // Offline or unreachable: the next tick retries.
                tracing::debug!(error = %err, "curriculum store unreachable, skipping tick");
                return 0;
            }
        };

        // Highest advertised version per (subject, grade).
        let mut best: HashMap<(String, String), (Version, String)> = HashMap::new();
        for key in keys {
            let Some((subject, grade, version)) = parse_remote_key(&key) else {
                tracing::debug!(key, "ignoring unrecognized key in curriculum store");
                continue;
            };
            let slot = best.entry((subject, grade)).or_insert((version.clone(), key.clone()));
            if version > slot.0 {
                *slot = (version, key);
            }
        }

        let mut applied = 0;
        for ((subject, grade), (version, key)) in best {
            let local = self.manager.active_version_for(&subject, &grade);
            let newer = local.as_ref().map(|l| version > *l).unwrap_or(true);
            if !newer {
                continue;
            }
            tracing::info!(
                subject,
                grade,
                remote = %version,
                local = %local.map(|v| v.to_string()).unwrap_or_else(|| "none".into()),
                "downloading curriculum update"
            );
            let bytes = match self.remote.get(&key).await {
                Ok((bytes, _etag)) => bytes,
                Err(err) => {
                    self.recorder.note_pull_failure();
                    tracing::warn!(key, error = %err, "curriculum download failed");
                    continue;
                }
            };
            match self.manager.install(&subject, &grade, &bytes).await {
                Ok(active) => {
                    self.recorder.note_pull_applied();
                    applied += 1;
                    tracing::info!(subject, grade, version = %active, "curriculum update applied");
                }
                Err(err) => {
                    self.recorder.note_pull_failure();
                    tracing::warn!(subject, grade, error = %err, "curriculum install failed");
                }
            }
        }
        applied
    }

    /// Run the periodic ticker until shutdown fires.
    pub async fn run(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("curriculum puller stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, ResponseCache};
    use crate::ports::{
        HashEmbedder, ManualClock, MemoryBlobStore, MemoryVectorStore, SledStore,
    };
    use crate::vkp::package::test_support::make_package;
    use crate::vkp::VkpManagerConfig;

    const DIM: usize = 16;

    #[test]
    fn remote_keys_parse() {
        let parsed = parse_remote_key("vkp/math/5/1.2.0.vkp").unwrap();
        assert_eq!(parsed.0, "math");
        assert_eq!(parsed.1, "5");
        assert_eq!(parsed.2, "1.2.0".parse::<Version>().unwrap());

        assert!(parse_remote_key("vkp/math/1.2.0.vkp").is_none());
        assert!(parse_remote_key("vkp/math/5/extra/1.2.0.vkp").is_none());
        assert!(parse_remote_key("vkp/math/5/not-semver.vkp").is_none());
        assert!(parse_remote_key("other/math/5/1.2.0.vkp").is_none());
    }

    fn fixture() -> (CurriculumPuller, Arc<MemoryBlobStore>, Arc<VkpManager>, Arc<TelemetryRecorder>, tempfile::TempDir)
    {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new("2026-02-01T00:00:00Z".parse().unwrap()));
        let relational = Arc::new(SledStore::open(dir.path().join("db")).unwrap());
        let cache = Arc::new(ResponseCache::new(CacheConfig::default(), None, clock.clone()));
        let manager = Arc::new(VkpManager::new(
            Arc::new(MemoryVectorStore::new()),
            relational,
            cache,
            Arc::new(MemoryBlobStore::new()),
            Arc::new(HashEmbedder::new(DIM)),
            clock,
            VkpManagerConfig::default(),
        ));
        let remote = Arc::new(MemoryBlobStore::new());
        let recorder = Arc::new(TelemetryRecorder::new(16));
        let puller = CurriculumPuller::new(remote.clone(), manager.clone(), recorder.clone());
        (puller, remote, manager, recorder, dir)
    }

    #[tokio::test]
    async fn installs_highest_remote_version() {
        let (puller, remote, manager, recorder, _dir) = fixture();
        for version in ["1.0.0", "1.2.0", "1.1.0"] {
            let pkg = make_package("math", "5", version, DIM, &[("fractions", "fractions")]);
            remote
                .put(
                    &format!("vkp/math/5/{version}.vkp"),
                    &pkg.to_bytes().unwrap(),
                )
                .await
                .unwrap();
        }

        let applied = puller.tick().await;
        assert_eq!(applied, 1);
        assert_eq!(
            manager.active_version_for("math", "5"),
            Some("1.2.0".parse().unwrap())
        );
        assert_eq!(recorder.counters().pull_applied, 1);

        // Same state next tick: nothing newer, nothing applied.
        assert_eq!(puller.tick().await, 0);
        assert_eq!(recorder.counters().pull_checks, 2);
    }

    #[tokio::test]
    async fn corrupt_remote_package_counts_as_failure() {
        let (puller, remote, manager, recorder, _dir) = fixture();
        let mut pkg = make_package("science", "4", "2.0.0", DIM, &[("plants", "plants")]);
        pkg.checksum = "sha256:0000".into();
        remote
            .put("vkp/science/4/2.0.0.vkp", &pkg.to_bytes().unwrap())
            .await
            .unwrap();

        assert_eq!(puller.tick().await, 0);
        assert_eq!(recorder.counters().pull_failures, 1);
        assert_eq!(manager.active_version_for("science", "4"), None);
    }

    #[tokio::test]
    async fn empty_remote_is_a_noop() {
        let (puller, _remote, _manager, recorder, _dir) = fixture();
        assert_eq!(puller.tick().await, 0);
        assert_eq!(recorder.counters().pull_checks, 1);
        assert_eq!(recorder.counters().pull_failures, 0);
    }
}
