//! Periodic component health checks and the restart policy.
//!
//! Every check interval the monitor probes the LLM, vector store, and
//! relational store plus host disk and memory, classifying each against
//! warn/critical thresholds. Consecutive all-up critical reports trip
//! the restart policy: the scheduler drains, in-flight requests are
//! cancelled, telemetry and backups flush, and the process is asked to
//! exit with a distinguishable code for the process manager to act on.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::backup::BackupScheduler;
use crate::ports::{LlmPort, RelationalStorePort, VectorStorePort};
use crate::scheduler::Scheduler;
use crate::telemetry::TelemetryPipeline;

/// Exit code the binary uses when the restart policy fires.
pub const RESTART_EXIT_CODE: i32 = 86;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warn,
    Critical,
}

/// One probed component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub detail: String,
}

impl ComponentHealth {
    fn healthy(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            detail: detail.into(),
        }
    }

    fn critical(detail: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Critical,
            detail: detail.into(),
        }
    }
}

/// Full report across components.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub components: BTreeMap<&'static str, ComponentHealth>,
    pub overall: HealthStatus,
}

impl HealthReport {
    fn from_components(components: BTreeMap<&'static str, ComponentHealth>) -> Self {
        let overall = components
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy);
        Self { components, overall }
    }
}

/// Free-space / free-memory thresholds, in bytes.
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub disk_warn: u64,
    pub disk_critical: u64,
    pub memory_warn: u64,
    pub memory_critical: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            disk_warn: 2 * 1024 * 1024 * 1024,
            disk_critical: 512 * 1024 * 1024,
            memory_warn: 1024 * 1024 * 1024,
            memory_critical: 256 * 1024 * 1024,
        }
    }
}

/// Monitor configuration.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub thresholds: HealthThresholds,
    /// Consecutive critical reports before the restart policy fires.
    pub consecutive_critical_limit: u32,
    /// Path whose filesystem is probed for free space.
    pub data_path: PathBuf,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            thresholds: HealthThresholds::default(),
            consecutive_critical_limit: 3,
            data_path: PathBuf::from("."),
        }
    }
}

/// Classify an available amount against warn/critical floors.
fn classify_free(available: u64, warn: u64, critical: u64) -> HealthStatus {
    if available < critical {
        HealthStatus::Critical
    } else if available < warn {
        HealthStatus::Warn
    } else {
        HealthStatus::Healthy
    }
}

fn format_gib(bytes: u64) -> String {
    format!("{:.1} GiB free", bytes as f64 / 1_073_741_824.0)
}

/// Probes components and enforces the restart policy.
pub struct HealthMonitor {
    llm: Arc<dyn LlmPort>,
    vector: Arc<dyn VectorStorePort>,
    relational: Arc<dyn RelationalStorePort>,
    scheduler: Arc<Scheduler>,
    telemetry: Arc<TelemetryPipeline>,
    backup: Arc<BackupScheduler>,
    config: HealthConfig,
    consecutive_critical: AtomicU32,
    restart_triggered: AtomicBool,
    /// Fired when the restart policy asks the process to exit.
    restart: CancellationToken,
    last_report: Mutex<Option<HealthReport>>,
}

impl HealthMonitor {
    pub fn new(
        llm: Arc<dyn LlmPort>,
        vector: Arc<dyn VectorStorePort>,
        relational: Arc<dyn RelationalStorePort>,
        scheduler: Arc<Scheduler>,
        telemetry: Arc<TelemetryPipeline>,
        backup: Arc<BackupScheduler>,
        config: HealthConfig,
    ) -> Self {
        Self {
            llm,
            vector,
            relational,
            scheduler,
            telemetry,
            backup,
            config,
            consecutive_critical: AtomicU32::new(0),
            restart_triggered: AtomicBool::new(false),
            restart: CancellationToken::new(),
            last_report: Mutex::new(None),
        }
    }

    /// Token that fires when the restart policy wants the process gone.
    pub fn restart_signal(&self) -> CancellationToken {
        self.restart.clone()
    }

    fn disk_health(&self) -> ComponentHealth {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let data_path = self
            .config
            .data_path
            .canonicalize()
            .unwrap_or_else(|_| self.config.data_path.clone());
        // Longest mount point that prefixes the data path wins.
        let available = disks
            .iter()
            .filter(|d| data_path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space());
        match available {
            Some(available) => ComponentHealth {
                status: classify_free(
                    available,
                    self.config.thresholds.disk_warn,
                    self.config.thresholds.disk_critical,
                ),
                detail: format_gib(available),
            },
            None => ComponentHealth::healthy("no matching disk found"),
        }
    }

    fn memory_health(&self) -> ComponentHealth {
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        let available = system.available_memory();
        ComponentHealth {
            status: classify_free(
                available,
                self.config.thresholds.memory_warn,
                self.config.thresholds.memory_critical,
            ),
            detail: format_gib(available),
        }
    }

    /// Probe every component once.
    pub async fn check_once(&self) -> HealthReport {
        let mut components = BTreeMap::new();
        components.insert(
            "llm",
            match self.llm.health().await {
                Ok(()) => ComponentHealth::healthy("reachable"),
                Err(err) => ComponentHealth::critical(err.to_string()),
            },
        );
        components.insert(
            "vector_store",
            match self.vector.health().await {
                Ok(()) => ComponentHealth::healthy("reachable"),
                Err(err) => ComponentHealth::critical(err.to_string()),
            },
        );
        components.insert(
            "relational_store",
            match self.relational.health().await {
                Ok(()) => ComponentHealth::healthy("reachable"),
                Err(err) => ComponentHealth::critical(err.to_string()),
            },
        );
        components.insert("disk", self.disk_health());
        components.insert("memory", self.memory_health());

        let report = HealthReport::from_components(components);
        let mut last = self.last_report.lock().unwrap_or_else(|e| e.into_inner());
        *last = Some(report.clone());
        report
    }

    /// Latest report, probing now if none exists yet.
    pub async fn report(&self) -> HealthReport {
        let cached = self
            .last_report
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match cached {
            Some(report) => report,
            None => self.check_once().await,
        }
    }

    /// One monitoring pass, escalating on consecutive criticals.
    pub async fn tick(&self) {
        let report = self.check_once().await;
        match report.overall {
            HealthStatus::Critical => {
                let streak = self.consecutive_critical.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(streak, "critical health report");
                if streak >= self.config.consecutive_critical_limit {
                    self.trigger_restart().await;
                }
            }
            HealthStatus::Warn => {
                self.consecutive_critical.store(0, Ordering::Relaxed);
                tracing::warn!("degraded health report");
            }
            HealthStatus::Healthy => {
                self.consecutive_critical.store(0, Ordering::Relaxed);
            }
        }
    }

    /// Drain, cancel, flush, and ask the process to exit. Idempotent.
    pub async fn trigger_restart(&self) {
        if self.restart_triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::error!(
            exit_code = RESTART_EXIT_CODE,
            "restart policy engaged: draining and flushing"
        );
        self.scheduler.drain();
        self.scheduler.cancel_all();
        self.telemetry.flush().await;
        self.backup.flush().await;
        self.restart.cancel();
    }

    /// Run the periodic monitor until shutdown fires.
    pub async fn run(self: Arc<Self>, period: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // Skip the immediate tick so boot isn't judged before adapters settle.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("health monitor stopped");
                    return;
                }
                _ = ticker.tick() => self.tick().await,
            }
        }
    }
}
