//! Scheduled snapshots of the relational and vector stores.
//!
//! Cron-style schedules: a weekly full snapshot of every table plus the
//! vector collections, and a daily incremental carrying the chat rows
//! added since the last full. Snapshots run in their own task with
//! short reads against the stores and never touch the scheduler.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::BackupError;
use crate::ports::{
    BlobStorePort, ChatRecord, ClockPort, MasteryRecord, PracticeQuestion, RelationalStorePort,
    StoredChunk, SubjectRecord, UserRecord, VectorStorePort, WeakArea,
};
use crate::vkp::VkpInstallation;

const FULL_PREFIX: &str = "backups/full/";
const INCREMENTAL_PREFIX: &str = "backups/incremental/";

/// Backup schedules and retention.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Cron expression (with seconds field) for full snapshots.
    pub full_schedule: String,
    /// Cron expression for incremental snapshots.
    pub incremental_schedule: String,
    pub retention_days: i64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            // Sunday 02:00 full, 01:30 nightly incremental.
            full_schedule: "0 0 2 * * Sun".into(),
            incremental_schedule: "0 30 1 * * *".into(),
            retention_days: 28,
        }
    }
}

/// A serialized snapshot.
#[derive(Debug, Serialize)]
struct BackupArchive {
    kind: &'static str,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    users: Vec<UserRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    subjects: Vec<SubjectRecord>,
    chats: Vec<ChatRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    mastery: Vec<MasteryRecord>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    weak_areas: Vec<WeakArea>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    practice: Vec<PracticeQuestion>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    installations: Vec<VkpInstallation>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    vector: BTreeMap<String, Vec<StoredChunk>>,
}

struct BackupState {
    last_full: Option<DateTime<Utc>>,
    next_full: Option<DateTime<Utc>>,
    next_incremental: Option<DateTime<Utc>>,
}

/// Runs the backup schedules against the blob store.
pub struct BackupScheduler {
    relational: Arc<dyn RelationalStorePort>,
    vector: Arc<dyn VectorStorePort>,
    blob: Arc<dyn BlobStorePort>,
    clock: Arc<dyn ClockPort>,
    full: Schedule,
    incremental: Schedule,
    retention: chrono::Duration,
    state: Mutex<BackupState>,
}

impl BackupScheduler {
    pub fn new(
        relational: Arc<dyn RelationalStorePort>,
        vector: Arc<dyn VectorStorePort>,
        blob: Arc<dyn BlobStorePort>,
        clock: Arc<dyn ClockPort>,
        config: BackupConfig,
    ) -> Result<Self, BackupError> {
        let full = Schedule::from_str(&config.full_schedule).map_err(|e| BackupError::Schedule {
            expr: config.full_schedule.clone(),
            message: e.to_string(),
        })?;
        let incremental =
            Schedule::from_str(&config.incremental_schedule).map_err(|e| BackupError::Schedule {
                expr: config.incremental_schedule.clone(),
                message: e.to_string(),
            })?;
        let now = clock.now();
        let state = BackupState {
            last_full: None,
            next_full: full.after(&now).next(),
            next_incremental: incremental.after(&now).next(),
        };
        Ok(Self {
            relational,
            vector,
            blob,
            clock,
            full,
            incremental,
            retention: chrono::Duration::days(config.retention_days.max(1)),
            state: Mutex::new(state),
        })
    }

    fn stamp(at: DateTime<Utc>) -> String {
        at.format("%Y%m%dT%H%M%S").to_string()
    }

    /// Take a full snapshot of every table and vector collection.
    pub async fn run_full(&self) -> Result<String, BackupError> {
        let now = self.clock.now();
        let users = self.relational.list_users().await?;
        let subjects = self.relational.list_subjects().await?;
        let chats = self.relational.list_chats_since(None).await?;
        let practice = {
            let mut all = Vec::new();
            for subject in &subjects {
                all.extend(
                    self.relational
                        .list_practice_questions(&subject.subject_id)
                        .await?,
                );
            }
            all
        };
        let (mut mastery, mut weak_areas) = (Vec::new(), Vec::new());
        for user in &users {
            for subject in &subjects {
                mastery.extend(
                    self.relational
                        .list_mastery(&user.user_id, &subject.subject_id)
                        .await?,
                );
                weak_areas.extend(
                    self.relational
                        .list_weak_areas(&user.user_id, &subject.subject_id)
                        .await?,
                );
            }
        }
        let installations = self.relational.list_installations().await?;

        let mut vector = BTreeMap::new();
        for subject in self.vector.subjects().await? {
            let chunks = self.vector.dump_subject(&subject).await?;
            vector.insert(subject, chunks);
        }

        let archive = BackupArchive {
            kind: "full",
            created_at: now,
            users,
            subjects,
            chats,
            mastery,
            weak_areas,
            practice,
            installations,
            vector,
        };
        let key = format!("{FULL_PREFIX}{}.json", Self::stamp(now));
        self.write_archive(&key, &archive).await?;

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.last_full = Some(now);
        tracing::info!(key, chats = archive.chats.len(), "full backup written");
        Ok(key)
    }

    /// Incremental: chat rows since the last full snapshot (all rows if
    /// no full has run yet).
    pub async fn run_incremental(&self) -> Result<String, BackupError> {
        let now = self.clock.now();
        let since = self
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_full;
        let chats = self.relational.list_chats_since(since).await?;
        let archive = BackupArchive {
            kind: "incremental",
            created_at: now,
            users: Vec::new(),
            subjects: Vec::new(),
            chats,
            mastery: Vec::new(),
            weak_areas: Vec::new(),
            practice: Vec::new(),
            installations: Vec::new(),
            vector: BTreeMap::new(),
        };
        let key = format!("{INCREMENTAL_PREFIX}{}.json", Self::stamp(now));
        self.write_archive(&key, &archive).await?;
        tracing::info!(key, chats = archive.chats.len(), "incremental backup written");
        Ok(key)
    }

    async fn write_archive(&self, key: &str, archive: &BackupArchive) -> Result<(), BackupError> {
        let bytes =
            serde_json::to_vec(archive).map_err(|e| BackupError::Serialization(e.to_string()))?;
        self.blob.put(key, &bytes).await?;
        Ok(())
    }

    /// Delete snapshots older than the retention window.
    pub async fn prune(&self) -> Result<usize, BackupError> {
        let cutoff = self.clock.now() - self.retention;
        let cutoff_stamp = Self::stamp(cutoff);
        let mut removed = 0;
        for prefix in [FULL_PREFIX, INCREMENTAL_PREFIX] {
            for key in self.blob.list(prefix).await? {
                let name = key.strip_prefix(prefix).unwrap_or(&key);
                // Keys are fixed-width timestamps; string order is time order.
                if name < cutoff_stamp.as_str() {
                    self.blob.delete(&key).await?;
                    removed += 1;
                }
            }
        }
        if removed > 0 {
            tracing::info!(removed, "pruned expired backups");
        }
        Ok(removed)
    }

    /// Run any schedule that has come due.
    pub async fn tick(&self) {
        let now = self.clock.now();
        let (full_due, incremental_due) = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let full_due = state.next_full.is_some_and(|at| at <= now);
            if full_due {
                state.next_full = self.full.after(&now).next();
            }
            let incremental_due = state.next_incremental.is_some_and(|at| at <= now);
            if incremental_due {
                state.next_incremental = self.incremental.after(&now).next();
            }
            (full_due, incremental_due)
        };

        if full_due {
            if let Err(err) = self.run_full().await {
                tracing::warn!(error = %err, "full backup failed");
            }
            if let Err(err) = self.prune().await {
                tracing::warn!(error = %err, "backup pruning failed");
            }
        } else if incremental_due {
            if let Err(err) = self.run_incremental().await {
                tracing::warn!(error = %err, "incremental backup failed");
            }
        }
    }

    /// Shutdown flush: capture everything since the last full snapshot.
    pub async fn flush(&self) {
        if let Err(err) = self.run_incremental().await {
            tracing::warn!(error = %err, "shutdown backup flush failed");
        }
    }

    /// Poll the schedules until shutdown fires.
    pub async fn run(self: Arc<Self>, check_interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.flush().await;
                    tracing::debug!("backup scheduler stopped");
                    return;
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{ManualClock, MemoryBlobStore, MemoryVectorStore, RelationalTx, SledStore};
    use uuid::Uuid;

    fn fixture() -> (
        BackupScheduler,
        Arc<SledStore>,
        Arc<MemoryBlobStore>,
        Arc<ManualClock>,
        tempfile::TempDir,
    ) {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new("2026-03-01T00:00:00Z".parse().unwrap()));
        let store = Arc::new(SledStore::open(dir.path().join("db")).unwrap());
        let blob = Arc::new(MemoryBlobStore::new());
        let scheduler = BackupScheduler::new(
            store.clone(),
            Arc::new(MemoryVectorStore::new()),
            blob.clone(),
            clock.clone(),
            BackupConfig::default(),
        )
        .unwrap();
        (scheduler, store, blob, clock, dir)
    }

    async fn insert_chat(store: &SledStore, at: &str) {
        let mut tx = store.begin().await.unwrap();
        tx.insert_chat(ChatRecord {
            chat_id: Uuid::new_v4(),
            user_id: "u1".into(),
            subject_id: "math".into(),
            question: "q".into(),
            response: "a".into(),
            confidence: 0.5,
            created_at: at.parse().unwrap(),
        });
        tx.commit().await.unwrap();
    }

    #[test]
    fn default_schedules_parse() {
        let config = BackupConfig::default();
        assert!(Schedule::from_str(&config.full_schedule).is_ok());
        assert!(Schedule::from_str(&config.incremental_schedule).is_ok());
    }

    #[test]
    fn bad_schedule_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new("2026-03-01T00:00:00Z".parse().unwrap()));
        let store = Arc::new(SledStore::open(dir.path().join("db")).unwrap());
        let result = BackupScheduler::new(
            store,
            Arc::new(MemoryVectorStore::new()),
            Arc::new(MemoryBlobStore::new()),
            clock,
            BackupConfig {
                full_schedule: "not a schedule".into(),
                ..BackupConfig::default()
            },
        );
        assert!(matches!(result, Err(BackupError::Schedule { .. })));
    }

    #[tokio::test]
    async fn incremental_covers_rows_since_last_full() {
        let (scheduler, store, blob, clock, _dir) = fixture();
        insert_chat(&store, "2026-02-28T10:00:00Z").await;
        scheduler.run_full().await.unwrap();

        clock.advance(chrono::Duration::days(1));
        insert_chat(&store, "2026-03-01T12:00:00Z").await;
        let key = scheduler.run_incremental().await.unwrap();

        let (bytes, _) = blob.get(&key).await.unwrap();
        let archive: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(archive["kind"], "incremental");
        assert_eq!(archive["chats"].as_array().unwrap().len(), 1);

        let full_keys = blob.list(FULL_PREFIX).await.unwrap();
        let (bytes, _) = blob.get(&full_keys[0]).await.unwrap();
        let full: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(full["chats"].as_array().unwrap().len(), 1);
        assert_eq!(full["kind"], "full");
    }

    #[tokio::test]
    async fn prune_removes_expired_snapshots() {
        let (scheduler, _store, blob, clock, _dir) = fixture();
        scheduler.run_full().await.unwrap();
        clock.advance(chrono::Duration::days(40));
        scheduler.run_full().await.unwrap();

        let removed = scheduler.prune().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(blob.list(FULL_PREFIX).await.unwrap().len(), 1);
    }
}
