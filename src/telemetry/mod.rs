//! Anonymized telemetry: per-request events, counters, aggregation, and
//! the cloud upload queue.
//!
//! Events carry only enumerated fields: no user ids, no question or
//! answer text, no addresses. Recording is non-blocking: the ring buffer
//! drops its oldest event on overflow and counts the drop, so a slow
//! upload path can never stall request serving.

mod pipeline;
mod scrub;

pub use pipeline::{StorageUsage, TelemetryConfig, TelemetryPipeline, TelemetrySummary};
pub use scrub::PiiScrubber;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, DurationRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;

/// One anonymized per-request record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEvent {
    /// Submission time rounded down to the hour.
    pub hour_bucket: DateTime<Utc>,
    pub latency_ms: u64,
    pub success: bool,
    /// Present exactly when `success` is false.
    pub error_kind: Option<ErrorKind>,
    pub subject_id: String,
    /// Active package version for the subject at completion time.
    pub vkp_version: Option<String>,
    pub cache_hit: bool,
}

/// Round a timestamp down to its hour bucket.
pub fn hour_bucket(at: DateTime<Utc>) -> DateTime<Utc> {
    at.duration_trunc(chrono::Duration::hours(1)).unwrap_or(at)
}

/// Counter snapshot folded into each aggregated summary.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TelemetryCounters {
    pub ring_overflow: u64,
    pub scrub_dropped: u64,
    pub topic_unresolved: u64,
    pub pull_checks: u64,
    pub pull_applied: u64,
    pub pull_failures: u64,
}

/// In-process event sink: bounded ring buffer plus counters.
pub struct TelemetryRecorder {
    ring: Mutex<VecDeque<TelemetryEvent>>,
    capacity: usize,
    ring_overflow: AtomicU64,
    scrub_dropped: AtomicU64,
    topic_unresolved: AtomicU64,
    pull_checks: AtomicU64,
    pull_applied: AtomicU64,
    pull_failures: AtomicU64,
}

impl TelemetryRecorder {
    /// `capacity` should be sized so a full aggregation tick of load fits.
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            ring_overflow: AtomicU64::new(0),
            scrub_dropped: AtomicU64::new(0),
            topic_unresolved: AtomicU64::new(0),
            pull_checks: AtomicU64::new(0),
            pull_applied: AtomicU64::new(0),
            pull_failures: AtomicU64::new(0),
        }
    }

    /// Record an event. Never blocks: on overflow the oldest event is
    /// dropped and counted.
    pub fn record(&self, event: TelemetryEvent) {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        if ring.len() == self.capacity {
            ring.pop_front();
            self.ring_overflow.fetch_add(1, Ordering::Relaxed);
        }
        ring.push_back(event);
    }

    /// Take the buffered events, leaving the ring empty.
    pub fn drain(&self) -> Vec<TelemetryEvent> {
        let mut ring = self.ring.lock().unwrap_or_else(|e| e.into_inner());
        ring.drain(..).collect()
    }

    /// Buffered event count (tests and stats).
    pub fn len(&self) -> usize {
        self.ring.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn note_scrub_dropped(&self) {
        self.scrub_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_topic_unresolved(&self) {
        self.topic_unresolved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_pull_check(&self) {
        self.pull_checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_pull_applied(&self) {
        self.pull_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn note_pull_failure(&self) {
        self.pull_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Current counter values.
    pub fn counters(&self) -> TelemetryCounters {
        TelemetryCounters {
            ring_overflow: self.ring_overflow.load(Ordering::Relaxed),
            scrub_dropped: self.scrub_dropped.load(Ordering::Relaxed),
            topic_unresolved: self.topic_unresolved.load(Ordering::Relaxed),
            pull_checks: self.pull_checks.load(Ordering::Relaxed),
            pull_applied: self.pull_applied.load(Ordering::Relaxed),
            pull_failures: self.pull_failures.load(Ordering::Relaxed),
        }
    }
}
