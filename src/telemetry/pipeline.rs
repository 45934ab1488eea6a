//! Aggregation and upload of telemetry summaries.
//!
//! On each tick the ring buffer is snapshotted and reset, events are
//! folded into per-hour summaries, the school identifier is replaced by
//! a salted one-way hash, and the serialized payload passes the PII
//! scrubber before landing in a persistent upload queue. Queued payloads
//! are pushed to the cloud blob store and removed on success; offline
//! operation queues indefinitely up to a high-water mark.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::PortError;
use crate::ports::{BlobStorePort, ClockPort, RelationalStorePort, VectorStorePort};
use crate::telemetry::{PiiScrubber, TelemetryCounters, TelemetryEvent, TelemetryRecorder};

/// Queue directory inside the node-local blob store.
const QUEUE_PREFIX: &str = "telemetry/queue/";
/// Destination directory on the cloud blob store.
const INBOX_PREFIX: &str = "telemetry/inbox/";

/// Storage probes included in every summary.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StorageUsage {
    pub chat_rows: u64,
    pub vector_chunks: u64,
    pub queued_payloads: u64,
}

/// One per-hour aggregate. Every field is enumerated or numeric; the
/// scrubber downstream enforces that nothing else sneaks in.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetrySummary {
    /// Salted one-way hash of the school identifier, or "anonymous".
    pub node: String,
    pub window_start: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub count: u64,
    pub successes: u64,
    pub failures: u64,
    pub latency_ms_p50: u64,
    pub latency_ms_p90: u64,
    pub latency_ms_p99: u64,
    pub error_kinds: BTreeMap<&'static str, u64>,
    pub cache_hit_rate: f64,
    pub per_subject: BTreeMap<String, u64>,
    pub per_version: BTreeMap<String, u64>,
    pub counters: TelemetryCounters,
    pub storage: StorageUsage,
}

/// Configuration for the telemetry pipeline.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// School identifier, hashed before leaving the node.
    pub school_id: Option<String>,
    /// Salt mixed into the school hash.
    pub school_salt: String,
    /// High-water mark for the persistent queue; oldest entries beyond
    /// it are culled with a warning.
    pub max_queued: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            school_id: None,
            school_salt: "studyhall".into(),
            max_queued: 512,
        }
    }
}

/// Aggregates events and drives the upload queue.
pub struct TelemetryPipeline {
    recorder: Arc<TelemetryRecorder>,
    scrubber: PiiScrubber,
    local: Arc<dyn BlobStorePort>,
    /// Cloud destination; `None` in sovereign mode (queueing continues,
    /// pushing does not).
    remote: Option<Arc<dyn BlobStorePort>>,
    relational: Arc<dyn RelationalStorePort>,
    vector: Arc<dyn VectorStorePort>,
    clock: Arc<dyn ClockPort>,
    config: TelemetryConfig,
}

impl TelemetryPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        recorder: Arc<TelemetryRecorder>,
        local: Arc<dyn BlobStorePort>,
        remote: Option<Arc<dyn BlobStorePort>>,
        relational: Arc<dyn RelationalStorePort>,
        vector: Arc<dyn VectorStorePort>,
        clock: Arc<dyn ClockPort>,
        config: TelemetryConfig,
    ) -> Self {
        Self {
            recorder,
            scrubber: PiiScrubber::new(),
            local,
            remote,
            relational,
            vector,
            clock,
            config,
        }
    }

    fn node_label(&self) -> String {
        match &self.config.school_id {
            Some(id) => {
                let mut hasher = Sha256::new();
                hasher.update(self.config.school_salt.as_bytes());
                hasher.update(b"|");
                hasher.update(id.as_bytes());
                let digest = hasher.finalize();
                // Letters-only encoding (one per nibble) so the label can
                // never look like a digit run to the scrubber downstream.
                let label: String = digest[..6]
                    .iter()
                    .flat_map(|b| [*b >> 4, *b & 0x0f])
                    .map(|nibble| char::from(b'a' + nibble))
                    .collect();
                format!("sh-{label}")
            }
            None => "anonymous".to_string(),
        }
    }

    async fn storage_usage(&self) -> StorageUsage {
        let chat_rows = self.relational.chat_count().await.unwrap_or(0) as u64;
        let mut vector_chunks = 0u64;
        if let Ok(subjects) = self.vector.subjects().await {
            for subject in subjects {
                vector_chunks += self.vector.chunk_count(&subject).await.unwrap_or(0) as u64;
            }
        }
        let queued_payloads = self
            .local
            .list(QUEUE_PREFIX)
            .await
            .map(|k| k.len() as u64)
            .unwrap_or(0);
        StorageUsage {
            chat_rows,
            vector_chunks,
            queued_payloads,
        }
    }

    /// Fold a batch of events into per-hour summaries.
    fn summarize(
        &self,
        events: &[TelemetryEvent],
        counters: TelemetryCounters,
        storage: StorageUsage,
    ) -> Vec<TelemetrySummary> {
        let mut buckets: BTreeMap<DateTime<Utc>, Vec<&TelemetryEvent>> = BTreeMap::new();
        for event in events {
            buckets.entry(event.hour_bucket).or_default().push(event);
        }

        let node = self.node_label();
        let generated_at = self.clock.now();
        buckets
            .into_iter()
            .map(|(window_start, bucket)| {
                let mut latencies: Vec<u64> = bucket.iter().map(|e| e.latency_ms).collect();
                latencies.sort_unstable();
                let successes = bucket.iter().filter(|e| e.success).count() as u64;
                let hits = bucket.iter().filter(|e| e.cache_hit).count() as u64;
                let count = bucket.len() as u64;

                let mut error_kinds: BTreeMap<&'static str, u64> = BTreeMap::new();
                let mut per_subject: BTreeMap<String, u64> = BTreeMap::new();
                let mut per_version: BTreeMap<String, u64> = BTreeMap::new();
                for event in &bucket {
                    if let Some(kind) = event.error_kind {
                        *error_kinds.entry(kind.as_str()).or_default() += 1;
                    }
                    *per_subject.entry(event.subject_id.clone()).or_default() += 1;
                    if let Some(version) = &event.vkp_version {
                        *per_version.entry(version.clone()).or_default() += 1;
                    }
                }

                // Rounded so serialized rates stay short.
                let cache_hit_rate = if count > 0 {
                    (hits as f64 / count as f64 * 10_000.0).round() / 10_000.0
                } else {
                    0.0
                };

                TelemetrySummary {
                    node: node.clone(),
                    window_start,
                    generated_at,
                    count,
                    successes,
                    failures: count - successes,
                    latency_ms_p50: percentile(&latencies, 0.50),
                    latency_ms_p90: percentile(&latencies, 0.90),
                    latency_ms_p99: percentile(&latencies, 0.99),
                    error_kinds,
                    cache_hit_rate,
                    per_subject,
                    per_version,
                    counters,
                    storage,
                }
            })
            .collect()
    }

    /// Snapshot the ring, build summaries, scrub, and enqueue.
    pub async fn aggregate_and_enqueue(&self) -> Result<usize, PortError> {
        let events = self.recorder.drain();
        if events.is_empty() {
            return Ok(0);
        }
        let counters = self.recorder.counters();
        let storage = self.storage_usage().await;
        let summaries = self.summarize(&events, counters, storage);

        let mut enqueued = 0;
        for summary in summaries {
            let payload = serde_json::to_string(&summary)
                .map_err(|e| PortError::Serialization(e.to_string()))?;
            if let Err(violation) = self.scrubber.scan(&payload) {
                self.recorder.note_scrub_dropped();
                tracing::warn!(
                    rule = violation.0,
                    window = %summary.window_start,
                    "telemetry payload failed PII scrub, dropped"
                );
                continue;
            }
            let key = format!(
                "{QUEUE_PREFIX}{}-{}.json",
                summary.window_start.format("%Y%m%dT%H%M%S"),
                Uuid::new_v4().simple()
            );
            self.local.put(&key, payload.as_bytes()).await?;
            enqueued += 1;
        }

        self.enforce_high_water().await?;
        Ok(enqueued)
    }

    /// Cull oldest queued payloads beyond the high-water mark.
    async fn enforce_high_water(&self) -> Result<(), PortError> {
        let keys = self.local.list(QUEUE_PREFIX).await?;
        if keys.len() <= self.config.max_queued {
            return Ok(());
        }
        let excess = keys.len() - self.config.max_queued;
        tracing::warn!(
            queued = keys.len(),
            culled = excess,
            "telemetry queue above high-water mark, culling oldest entries"
        );
        for key in keys.iter().take(excess) {
            self.local.delete(key).await?;
        }
        Ok(())
    }

    /// Push queued payloads to the cloud store, removing on success.
    ///
    /// Failures leave the queue untouched; the next tick retries. A
    /// disabled remote (sovereign mode) is a no-op.
    pub async fn push_pending(&self) -> Result<usize, PortError> {
        let Some(remote) = &self.remote else {
            return Ok(0);
        };
        let keys = self.local.list(QUEUE_PREFIX).await?;
        let mut pushed = 0;
        for key in keys {
            let (bytes, _etag) = self.local.get(&key).await?;
            let name = key.strip_prefix(QUEUE_PREFIX).unwrap_or(&key);
            let dest = format!("{INBOX_PREFIX}{name}");
            match remote.put(&dest, &bytes).await {
                Ok(()) => {
                    self.local.delete(&key).await?;
                    pushed += 1;
                }
                Err(err) => {
                    tracing::warn!(error = %err, "telemetry push failed, will retry next tick");
                    break;
                }
            }
        }
        Ok(pushed)
    }

    /// One full tick: aggregate, enqueue, push.
    pub async fn tick(&self) {
        match self.aggregate_and_enqueue().await {
            Ok(n) if n > 0 => tracing::debug!(summaries = n, "telemetry aggregated"),
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "telemetry aggregation failed"),
        }
        match self.push_pending().await {
            Ok(n) if n > 0 => tracing::info!(pushed = n, "telemetry uploaded"),
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "telemetry push errored"),
        }
    }

    /// Flush everything buffered; used by shutdown and the restart policy.
    pub async fn flush(&self) {
        self.tick().await;
    }

    /// Run the periodic ticker until shutdown fires.
    pub async fn run(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would aggregate an empty ring.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.flush().await;
                    tracing::debug!("telemetry pipeline stopped");
                    return;
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
    }
}

/// Nearest-rank percentile over a sorted slice; 0 for empty input.
fn percentile(sorted: &[u64], q: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = (sorted.len() as f64 * q).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}
