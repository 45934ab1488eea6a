//! The node's service surface.
//!
//! Transport-agnostic: an HTTP layer, a CLI, or a test sits on top of
//! [`Node`] and calls these methods directly. Validation happens here
//! (empty questions, unknown subjects and users) so the scheduler and
//! pipeline only ever see well-formed queries.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use semver::Version;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::{CacheStats, ResponseCache};
use crate::error::{PortError, QueryError, VkpError};
use crate::health::{HealthMonitor, HealthReport};
use crate::pedagogy::MasteryTracker;
use crate::ports::{
    ClockPort, MasteryRecord, PracticeQuestion, RelationalStorePort, SubjectRecord, UserRecord,
    WeakArea,
};
use crate::scheduler::{QueryHandle, Scheduler, SchedulerStats};
use crate::sync::CurriculumPuller;
use crate::telemetry::TelemetryPipeline;
use crate::types::Query;
use crate::vkp::{VkpInstallation, VkpManager};

/// Upper bound on accepted question length, in characters.
pub const MAX_QUESTION_CHARS: usize = 2000;

/// Background job cadence handed to [`Node::start_background`].
#[derive(Debug, Clone)]
pub struct BackgroundIntervals {
    pub vkp_pull: Duration,
    pub telemetry_upload: Duration,
    pub health_check: Duration,
    pub backup_poll: Duration,
}

/// The assembled tutoring node.
pub struct Node {
    scheduler: Arc<Scheduler>,
    cache: Arc<ResponseCache>,
    vkp: Arc<VkpManager>,
    pedagogy: Arc<MasteryTracker>,
    relational: Arc<dyn RelationalStorePort>,
    telemetry: Arc<TelemetryPipeline>,
    backup: Arc<crate::backup::BackupScheduler>,
    health: Arc<HealthMonitor>,
    /// Present when a cloud store is configured and sovereign mode is off.
    puller: Option<Arc<CurriculumPuller>>,
    clock: Arc<dyn ClockPort>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduler: Arc<Scheduler>,
        cache: Arc<ResponseCache>,
        vkp: Arc<VkpManager>,
        pedagogy: Arc<MasteryTracker>,
        relational: Arc<dyn RelationalStorePort>,
        telemetry: Arc<TelemetryPipeline>,
        backup: Arc<crate::backup::BackupScheduler>,
        health: Arc<HealthMonitor>,
        puller: Option<Arc<CurriculumPuller>>,
        clock: Arc<dyn ClockPort>,
    ) -> Self {
        Self {
            scheduler,
            cache,
            vkp,
            pedagogy,
            relational,
            telemetry,
            backup,
            health,
            puller,
            clock,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    // ── Query serving ────────────────────────────────────────────

    /// Validate and admit a question; returns the token stream handle.
    pub async fn submit_query(
        &self,
        user_id: &str,
        subject_id: &str,
        question: &str,
        deadline: Option<Duration>,
    ) -> Result<QueryHandle, QueryError> {
        let trimmed = question.trim();
        if trimmed.is_empty() {
            return Err(QueryError::BadRequest {
                reason: "question is empty".into(),
            });
        }
        if trimmed.chars().count() > MAX_QUESTION_CHARS {
            return Err(QueryError::BadRequest {
                reason: format!("question exceeds {MAX_QUESTION_CHARS} characters"),
            });
        }
        let subject = self
            .relational
            .get_subject(subject_id)
            .await
            .map_err(|e| QueryError::from_port("relational_store", e))?;
        if subject.is_none() {
            return Err(QueryError::BadRequest {
                reason: format!("unknown subject {subject_id:?}"),
            });
        }
        let user = self
            .relational
            .get_user(user_id)
            .await
            .map_err(|e| QueryError::from_port("relational_store", e))?;
        if user.is_none() {
            return Err(QueryError::BadRequest {
                reason: format!("unknown user {user_id:?}"),
            });
        }

        let now = self.clock.now();
        let query = Query {
            query_id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            subject_id: subject_id.to_string(),
            question: question.to_string(),
            submitted_at: now,
            deadline: deadline.map(|d| now + chrono::Duration::from_std(d).unwrap_or_default()),
        };
        self.scheduler.submit(query)
    }

    /// Signal cancellation for an admitted query.
    pub fn cancel_query(&self, query_id: Uuid) -> Result<(), QueryError> {
        self.scheduler.cancel(query_id)
    }

    pub fn queue_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    // ── Pedagogy ─────────────────────────────────────────────────

    pub async fn mastery(
        &self,
        user_id: &str,
        subject_id: &str,
    ) -> Result<Vec<MasteryRecord>, PortError> {
        self.pedagogy.mastery_for(user_id, subject_id).await
    }

    pub async fn weak_areas(
        &self,
        user_id: &str,
        subject_id: &str,
    ) -> Result<Vec<WeakArea>, PortError> {
        self.pedagogy.weak_areas_for(user_id, subject_id).await
    }

    pub async fn practice_questions(
        &self,
        user_id: &str,
        subject_id: &str,
        limit: usize,
    ) -> Result<Vec<PracticeQuestion>, PortError> {
        self.pedagogy.practice_for(user_id, subject_id, limit).await
    }

    // ── Cache ────────────────────────────────────────────────────

    pub async fn cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    /// Purge cache entries matching a prefix pattern; returns how many.
    pub async fn invalidate_cache(&self, pattern: &str) -> usize {
        self.cache.invalidate(pattern).await
    }

    // ── Curriculum packages ──────────────────────────────────────

    pub async fn install_vkp(
        &self,
        subject: &str,
        grade: &str,
        bytes: &[u8],
    ) -> Result<Version, VkpError> {
        self.vkp.install(subject, grade, bytes).await
    }

    pub async fn rollback_vkp(&self, subject: &str, grade: &str) -> Result<Version, VkpError> {
        self.vkp.rollback(subject, grade).await
    }

    pub fn installations(&self) -> Vec<VkpInstallation> {
        self.vkp.installations()
    }

    // ── Directories & seeding ────────────────────────────────────

    pub async fn register_user(&self, user_id: &str, display_name: &str) -> Result<(), PortError> {
        self.relational
            .upsert_user(&UserRecord {
                user_id: user_id.to_string(),
                display_name: display_name.to_string(),
                created_at: self.clock.now(),
            })
            .await
    }

    pub async fn register_subject(&self, subject_id: &str, name: &str) -> Result<(), PortError> {
        self.relational
            .upsert_subject(&SubjectRecord {
                subject_id: subject_id.to_string(),
                name: name.to_string(),
                created_at: self.clock.now(),
            })
            .await
    }

    /// Load the practice question bank the selector draws from.
    pub async fn seed_practice_questions(
        &self,
        items: &[PracticeQuestion],
    ) -> Result<(), PortError> {
        self.relational.put_practice_questions(items).await
    }

    // ── Health & lifecycle ───────────────────────────────────────

    pub async fn health(&self) -> HealthReport {
        self.health.report().await
    }

    /// Fires when the restart policy wants the process replaced.
    pub fn restart_signal(&self) -> CancellationToken {
        self.health.restart_signal()
    }

    /// Spawn the background tickers (curriculum pull, telemetry,
    /// backups, health).
    pub fn start_background(&self, intervals: BackgroundIntervals) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(puller) = &self.puller {
            tasks.push(tokio::spawn(Arc::clone(puller).run(
                intervals.vkp_pull,
                self.shutdown.clone(),
            )));
        }
        tasks.push(tokio::spawn(Arc::clone(&self.telemetry).run(
            intervals.telemetry_upload,
            self.shutdown.clone(),
        )));
        tasks.push(tokio::spawn(Arc::clone(&self.backup).run(
            intervals.backup_poll,
            self.shutdown.clone(),
        )));
        tasks.push(tokio::spawn(Arc::clone(&self.health).run(
            intervals.health_check,
            self.shutdown.clone(),
        )));
    }

    /// Graceful shutdown: drain admissions, cancel in-flight work, stop
    /// tickers (each flushes on its way out), and wait for them.
    pub async fn shutdown(&self) {
        tracing::info!("node shutting down");
        self.scheduler.drain();
        self.scheduler.cancel_all();
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        // Stopped tickers have flushed; catch anything recorded since.
        self.telemetry.flush().await;
    }
}
