//! Node configuration.
//!
//! An explicit `Config` value built once from the environment and
//! passed into bootstrap; no global mutable state. Every knob has a
//! default that works for a single-machine deployment, so an empty
//! environment boots a functional (offline) node.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::backup::BackupConfig;
use crate::cache::CacheConfig;
use crate::error::ConfigError;
use crate::health::{HealthConfig, HealthThresholds};
use crate::orchestrator::OrchestratorConfig;
use crate::scheduler::SchedulerConfig;
use crate::telemetry::TelemetryConfig;

const ENV_PREFIX: &str = "STUDYHALL_";

fn env_var(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .filter(|v| !v.is_empty())
}

fn parse_env<T: FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env_var(key) {
        Some(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{key}"),
            message: format!("{e}"),
        }),
        None => Ok(default),
    }
}

fn parse_bool(key: &str, default: bool) -> Result<bool, ConfigError> {
    match env_var(key) {
        Some(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}{key}"),
                message: format!("expected boolean, got {other:?}"),
            }),
        },
        None => Ok(default),
    }
}

/// Identity and storage layout of this node.
#[derive(Debug, Clone)]
pub struct NodeSettings {
    /// Root of all node-local state (database, packages, queues, backups).
    pub data_dir: PathBuf,
    /// School identifier; hashed before it ever leaves the node.
    pub school_id: Option<String>,
    /// No outbound cloud traffic at all: curriculum pull and telemetry
    /// push are disabled, everything else runs normally.
    pub sovereign_mode: bool,
    /// Mount point of the cloud blob store (synced by an external
    /// agent). Absent means the node runs fully offline.
    pub remote_root: Option<PathBuf>,
}

/// Local inference server endpoints.
#[derive(Debug, Clone)]
pub struct InferenceSettings {
    pub llm_base_url: String,
    pub llm_model: String,
    pub api_key: Option<String>,
    pub request_timeout: Duration,
    pub embedding_base_url: String,
    pub embedding_model: String,
    pub embedding_dimension: usize,
    /// Fall back to the local hash embedder when the server fails.
    pub embedding_fallback: bool,
}

/// Background job cadence.
#[derive(Debug, Clone)]
pub struct IntervalSettings {
    pub vkp_pull_interval: Duration,
    pub telemetry_upload_interval: Duration,
    pub health_check_interval: Duration,
    /// How often the backup schedules are evaluated.
    pub backup_poll_interval: Duration,
}

/// Complete node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub node: NodeSettings,
    pub inference: InferenceSettings,
    pub intervals: IntervalSettings,
    pub scheduler: SchedulerConfig,
    pub cache: CacheConfig,
    pub orchestrator: OrchestratorConfig,
    pub backup: BackupConfig,
    pub health: HealthConfig,
    pub telemetry: TelemetryConfig,
    /// Ring buffer capacity for per-request telemetry events.
    pub telemetry_ring_capacity: usize,
}

impl Config {
    /// Load from `STUDYHALL_*` environment variables (a `.env` file is
    /// honored when present), falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let _ = dotenvy::dotenv();

        let data_dir = PathBuf::from(
            env_var("DATA_DIR").unwrap_or_else(|| "./data".to_string()),
        );
        let node = NodeSettings {
            data_dir: data_dir.clone(),
            school_id: env_var("SCHOOL_ID"),
            sovereign_mode: parse_bool("SOVEREIGN_MODE", false)?,
            remote_root: env_var("REMOTE_ROOT").map(PathBuf::from),
        };

        let llm_base_url =
            env_var("LLM_URL").unwrap_or_else(|| "http://127.0.0.1:8080".to_string());
        let inference = InferenceSettings {
            embedding_base_url: env_var("EMBEDDING_URL").unwrap_or_else(|| llm_base_url.clone()),
            llm_base_url,
            llm_model: env_var("LLM_MODEL").unwrap_or_else(|| "local".to_string()),
            api_key: env_var("LLM_API_KEY"),
            request_timeout: Duration::from_secs(parse_env("LLM_TIMEOUT_SECONDS", 120u64)?),
            embedding_model: env_var("EMBEDDING_MODEL")
                .unwrap_or_else(|| "all-minilm-l6-v2".to_string()),
            embedding_dimension: parse_env("EMBEDDING_DIMENSION", 384usize)?,
            embedding_fallback: parse_bool("EMBEDDING_FALLBACK", false)?,
        };

        let intervals = IntervalSettings {
            vkp_pull_interval: Duration::from_secs(parse_env("VKP_PULL_INTERVAL", 3600u64)?),
            telemetry_upload_interval: Duration::from_secs(parse_env(
                "TELEMETRY_UPLOAD_INTERVAL",
                3600u64,
            )?),
            health_check_interval: Duration::from_secs(parse_env("HEALTH_CHECK_INTERVAL", 300u64)?),
            backup_poll_interval: Duration::from_secs(60),
        };

        let scheduler = SchedulerConfig {
            workers: parse_env("WORKERS", SchedulerConfig::default().workers)?,
            queue_capacity: parse_env("QUEUE_CAPACITY", SchedulerConfig::default().queue_capacity)?,
            ..SchedulerConfig::default()
        };

        let cache = CacheConfig {
            ttl: Duration::from_secs(parse_env(
                "CACHE_TTL_SECONDS",
                CacheConfig::default().ttl.as_secs(),
            )?),
            max_entries: parse_env("CACHE_MAX_ENTRIES", CacheConfig::default().max_entries)?,
        };

        let orchestrator = OrchestratorConfig {
            top_k: parse_env("RETRIEVAL_TOP_K", OrchestratorConfig::default().top_k)?,
            max_tokens: parse_env("MAX_TOKENS", OrchestratorConfig::default().max_tokens)?,
            context_window: parse_env(
                "CONTEXT_WINDOW",
                OrchestratorConfig::default().context_window,
            )?,
            ..OrchestratorConfig::default()
        };

        let backup = BackupConfig {
            full_schedule: env_var("BACKUP_FULL_SCHEDULE")
                .unwrap_or_else(|| BackupConfig::default().full_schedule),
            incremental_schedule: env_var("BACKUP_INCREMENTAL_SCHEDULE")
                .unwrap_or_else(|| BackupConfig::default().incremental_schedule),
            retention_days: parse_env(
                "BACKUP_RETENTION_DAYS",
                BackupConfig::default().retention_days,
            )?,
        };

        let health = HealthConfig {
            thresholds: HealthThresholds::default(),
            consecutive_critical_limit: parse_env("HEALTH_CRITICAL_LIMIT", 3u32)?,
            data_path: data_dir,
        };

        let telemetry = TelemetryConfig {
            school_id: node.school_id.clone(),
            school_salt: env_var("TELEMETRY_SALT").unwrap_or_else(|| "studyhall".to_string()),
            max_queued: parse_env("TELEMETRY_MAX_QUEUED", 512usize)?,
        };

        Ok(Self {
            node,
            inference,
            intervals,
            scheduler,
            cache,
            orchestrator,
            backup,
            health,
            telemetry,
            telemetry_ring_capacity: parse_env("TELEMETRY_RING_CAPACITY", 4096usize)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Environment-variable tests mutate process state; everything here
    // sticks to defaults to stay parallel-safe.

    #[test]
    fn defaults_describe_an_offline_node() {
        let config = Config::from_env().expect("defaults load");
        assert!(!config.node.sovereign_mode);
        assert_eq!(config.scheduler.workers, 5);
        assert_eq!(config.scheduler.queue_capacity, 1000);
        assert_eq!(config.cache.ttl.as_secs(), 24 * 60 * 60);
        assert_eq!(config.inference.embedding_dimension, 384);
        assert_eq!(config.intervals.vkp_pull_interval.as_secs(), 3600);
    }
}
