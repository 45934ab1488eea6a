//! Response cache with versioned keys and pattern invalidation.
//!
//! Keyed by a SHA-256 over the normalized question, subject, and the
//! subject's active package version, so a version bump makes every prior
//! entry unreachable even before the explicit purge. Two tiers: an
//! optional remote shared backend and an in-process LRU; a remote outage
//! falls back to the LRU transparently with a single warning per outage.
//!
//! The cache never guesses when versions change; invalidation on
//! install is driven by the package manager.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::PortError;
use crate::ports::ClockPort;
use crate::types::Answer;

/// Default entry lifetime: 24 hours.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Default in-process tier capacity.
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Lowercase and strip surrounding whitespace.
///
/// Two questions differing only in letter case or surrounding whitespace
/// must land on the same key.
pub fn normalize_question(question: &str) -> String {
    question.trim().to_lowercase()
}

/// Compose the cache key for (question, subject, active version).
///
/// The key embeds the subject and version as a plain prefix so pattern
/// invalidation can purge one subject, and a SHA-256 digest of
/// `normalized ∥ ":" ∥ subject ∥ ":" ∥ version` so distinct questions
/// never collide.
pub fn compose_key(question: &str, subject_id: &str, version: &str) -> String {
    let normalized = normalize_question(question);
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hasher.update(b":");
    hasher.update(subject_id.as_bytes());
    hasher.update(b":");
    hasher.update(version.as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("response:v={subject_id}:{version}:{digest}")
}

/// Invalidation prefix covering every version of a subject.
pub fn subject_prefix(subject_id: &str) -> String {
    format!("response:v={subject_id}:")
}

/// A cached answer with its creation time for TTL checks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedAnswer {
    pub answer: Answer,
    pub created_at: DateTime<Utc>,
}

/// Remote shared cache tier (e.g. a LAN key-value service).
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CachedAnswer>, PortError>;
    async fn put(&self, key: &str, value: &CachedAnswer, ttl: Duration) -> Result<(), PortError>;
    /// Remove all keys with the given prefix; returns how many.
    async fn invalidate_prefix(&self, prefix: &str) -> Result<usize, PortError>;
    async fn key_count(&self) -> Result<usize, PortError>;
    fn name(&self) -> &'static str;
}

/// Cache observability counters.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub backend: String,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub key_count: usize,
}

/// Configuration for the response cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TTL,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

/// Two-tier response cache.
pub struct ResponseCache {
    /// In-process tier. `std::sync::Mutex`: acquisitions are short and
    /// never held across an await point.
    local: Mutex<LruCache<String, CachedAnswer>>,
    remote: Option<Arc<dyn CacheBackend>>,
    clock: Arc<dyn ClockPort>,
    ttl: chrono::Duration,
    default_ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    /// Set while the remote tier is in an outage, to log exactly one
    /// warning per outage.
    outage_logged: AtomicBool,
}

impl ResponseCache {
    pub fn new(
        config: CacheConfig,
        remote: Option<Arc<dyn CacheBackend>>,
        clock: Arc<dyn ClockPort>,
    ) -> Self {
        let capacity =
            NonZeroUsize::new(config.max_entries.max(1)).expect("max(1) is non-zero");
        Self {
            local: Mutex::new(LruCache::new(capacity)),
            remote,
            clock,
            ttl: chrono::Duration::from_std(config.ttl)
                .unwrap_or_else(|_| chrono::Duration::hours(24)),
            default_ttl: config.ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            outage_logged: AtomicBool::new(false),
        }
    }

    fn note_remote_failure(&self, err: &PortError) {
        if !self.outage_logged.swap(true, Ordering::Relaxed) {
            tracing::warn!(error = %err, "remote cache unavailable, serving from in-process tier");
        }
    }

    fn note_remote_success(&self) {
        self.outage_logged.store(false, Ordering::Relaxed);
    }

    fn is_fresh(&self, entry: &CachedAnswer) -> bool {
        self.clock.now() - entry.created_at < self.ttl
    }

    fn local_get(&self, key: &str) -> Option<Answer> {
        let mut local = self.local.lock().unwrap_or_else(|e| e.into_inner());
        let fresh = match local.get(key) {
            Some(entry) if self.is_fresh(entry) => Some(entry.answer.clone()),
            Some(_) => None,
            None => return None,
        };
        if fresh.is_none() {
            // Expired: evict lazily on read.
            local.pop(key);
        }
        fresh
    }

    /// Look up an answer. Counts a hit or miss either way.
    pub async fn get(&self, key: &str) -> Option<Answer> {
        let found = match &self.remote {
            Some(remote) => match remote.get(key).await {
                Ok(Some(entry)) => {
                    self.note_remote_success();
                    if self.is_fresh(&entry) {
                        Some(entry.answer)
                    } else {
                        None
                    }
                }
                Ok(None) => {
                    self.note_remote_success();
                    None
                }
                Err(err) => {
                    self.note_remote_failure(&err);
                    self.local_get(key)
                }
            },
            None => self.local_get(key),
        };

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    /// Store an answer under the default TTL.
    pub async fn put(&self, key: &str, answer: Answer) {
        self.put_with_ttl(key, answer, self.default_ttl).await;
    }

    /// Store an answer with an explicit TTL.
    pub async fn put_with_ttl(&self, key: &str, answer: Answer, ttl: Duration) {
        let entry = CachedAnswer {
            answer,
            created_at: self.clock.now(),
        };
        if let Some(remote) = &self.remote {
            match remote.put(key, &entry, ttl).await {
                Ok(()) => {
                    self.note_remote_success();
                    return;
                }
                Err(err) => self.note_remote_failure(&err),
            }
        }
        let mut local = self.local.lock().unwrap_or_else(|e| e.into_inner());
        local.put(key.to_string(), entry);
    }

    /// Remove entries matching a prefix pattern.
    ///
    /// Patterns are prefixes with an optional trailing `*`:
    /// `"response:v=math:"` purges one subject, `"response:*"`
    /// everything. Returns the number of removed entries (best effort
    /// when the remote tier is down).
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        let mut removed = 0;

        if let Some(remote) = &self.remote {
            match remote.invalidate_prefix(prefix).await {
                Ok(n) => {
                    self.note_remote_success();
                    removed += n;
                }
                Err(err) => self.note_remote_failure(&err),
            }
        }

        let mut local = self.local.lock().unwrap_or_else(|e| e.into_inner());
        let matching: Vec<String> = local
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in matching {
            local.pop(&key);
            removed += 1;
        }
        removed
    }

    /// Hit/miss counters and key count.
    pub async fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_rate = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };

        let local_count = self.local.lock().unwrap_or_else(|e| e.into_inner()).len();
        let (backend, key_count) = match &self.remote {
            Some(remote) => match remote.key_count().await {
                Ok(n) => (remote.name().to_string(), n),
                Err(err) => {
                    self.note_remote_failure(&err);
                    (format!("{} (degraded)", remote.name()), local_count)
                }
            },
            None => ("memory".to_string(), local_count),
        };

        CacheStats {
            backend,
            hits,
            misses,
            hit_rate,
            key_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ManualClock;
    use crate::types::Answer;

    fn answer(text: &str) -> Answer {
        Answer {
            text: text.into(),
            confidence: 0.9,
            sources: Vec::new(),
            token_count: 3,
            latency_ms: 12,
        }
    }

    fn cache_with_clock() -> (ResponseCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new("2026-01-01T00:00:00Z".parse().unwrap()));
        let cache = ResponseCache::new(CacheConfig::default(), None, clock.clone());
        (cache, clock)
    }

    #[test]
    fn normalization_collapses_case_and_whitespace() {
        let base = compose_key("What is recursion?", "cs", "1.0.0");
        assert_eq!(compose_key("  what is recursion?  ", "cs", "1.0.0"), base);
        assert_eq!(compose_key("WHAT IS RECURSION?", "cs", "1.0.0"), base);
        // Normalizing is idempotent.
        assert_eq!(
            compose_key(&normalize_question("What is recursion?"), "cs", "1.0.0"),
            base
        );
    }

    #[test]
    fn version_bump_changes_key() {
        let v1 = compose_key("What is recursion?", "cs", "1.0.0");
        let v2 = compose_key("What is recursion?", "cs", "1.1.0");
        assert_ne!(v1, v2);
        assert!(v1.starts_with("response:v=cs:1.0.0:"));
        assert!(v2.starts_with("response:v=cs:1.1.0:"));
    }

    #[tokio::test]
    async fn round_trip_within_ttl() {
        let (cache, _clock) = cache_with_clock();
        let key = compose_key("q", "math", "1.0.0");
        cache.put(&key, answer("a part of a whole")).await;
        assert_eq!(
            cache.get(&key).await.map(|a| a.text),
            Some("a part of a whole".to_string())
        );
    }

    #[tokio::test]
    async fn expired_entries_are_evicted_on_read() {
        let (cache, clock) = cache_with_clock();
        let key = compose_key("q", "math", "1.0.0");
        cache.put(&key, answer("x")).await;
        clock.advance(chrono::Duration::hours(25));
        assert!(cache.get(&key).await.is_none());
        let stats = cache.stats().await;
        assert_eq!(stats.key_count, 0);
    }

    #[tokio::test]
    async fn invalidate_by_subject_prefix() {
        let (cache, _clock) = cache_with_clock();
        cache
            .put(&compose_key("q1", "math", "1.0.0"), answer("a"))
            .await;
        cache
            .put(&compose_key("q2", "math", "1.0.0"), answer("b"))
            .await;
        cache
            .put(&compose_key("q1", "science", "2.0.0"), answer("c"))
            .await;

        let removed = cache.invalidate(&subject_prefix("math")).await;
        assert_eq!(removed, 2);
        assert_eq!(cache.stats().await.key_count, 1);

        let removed = cache.invalidate("response:*").await;
        assert_eq!(removed, 1);
        assert_eq!(cache.stats().await.key_count, 0);
    }

    #[tokio::test]
    async fn hit_rate_counts_both_outcomes() {
        let (cache, _clock) = cache_with_clock();
        let key = compose_key("q", "math", "1.0.0");
        assert!(cache.get(&key).await.is_none());
        cache.put(&key, answer("a")).await;
        assert!(cache.get(&key).await.is_some());
        let stats = cache.stats().await;
        assert_eq!((stats.hits, stats.misses), (1, 1));
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
    }

    struct FlakyBackend {
        inner: Mutex<std::collections::HashMap<String, CachedAnswer>>,
        down: AtomicBool,
    }

    #[async_trait]
    impl CacheBackend for FlakyBackend {
        async fn get(&self, key: &str) -> Result<Option<CachedAnswer>, PortError> {
            if self.down.load(Ordering::Relaxed) {
                return Err(PortError::Unavailable {
                    port: "cache",
                    reason: "down".into(),
                });
            }
            Ok(self
                .inner
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .get(key)
                .cloned())
        }
        async fn put(
            &self,
            key: &str,
            value: &CachedAnswer,
            _ttl: Duration,
        ) -> Result<(), PortError> {
            if self.down.load(Ordering::Relaxed) {
                return Err(PortError::Unavailable {
                    port: "cache",
                    reason: "down".into(),
                });
            }
            self.inner
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(key.to_string(), value.clone());
            Ok(())
        }
        async fn invalidate_prefix(&self, prefix: &str) -> Result<usize, PortError> {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            let before = inner.len();
            inner.retain(|k, _| !k.starts_with(prefix));
            Ok(before - inner.len())
        }
        async fn key_count(&self) -> Result<usize, PortError> {
            Ok(self.inner.lock().unwrap_or_else(|e| e.into_inner()).len())
        }
        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn remote_outage_falls_back_to_local() {
        let backend = Arc::new(FlakyBackend {
            inner: Mutex::new(Default::default()),
            down: AtomicBool::new(true),
        });
        let clock = Arc::new(ManualClock::new("2026-01-01T00:00:00Z".parse().unwrap()));
        let cache = ResponseCache::new(CacheConfig::default(), Some(backend.clone()), clock);

        let key = compose_key("q", "math", "1.0.0");
        // Remote down: the put lands in the local tier and is readable.
        cache.put(&key, answer("local copy")).await;
        assert!(cache.get(&key).await.is_some());

        // Remote back up: reads go through it again.
        backend.down.store(false, Ordering::Relaxed);
        assert!(cache.get(&key).await.is_none());
        cache.put(&key, answer("remote copy")).await;
        assert_eq!(
            cache.get(&key).await.map(|a| a.text),
            Some("remote copy".to_string())
        );
    }
}
