//! Wiring: configuration → adapters → components → [`Node`].
//!
//! All long-lived state hangs off the returned `Node`; nothing global.
//! Adapter choices: sled for the relational store, an in-process vector
//! store rebuilt from retained package artifacts, local directories for
//! blob storage, and an OpenAI-compatible server on the LAN for
//! inference and embeddings (with an optional local hash-embedding
//! fallback).

use std::sync::Arc;

use crate::api::{BackgroundIntervals, Node};
use crate::backup::BackupScheduler;
use crate::cache::ResponseCache;
use crate::config::Config;
use crate::error::Error;
use crate::health::HealthMonitor;
use crate::orchestrator::Orchestrator;
use crate::pedagogy::{MasteryTracker, PedagogyConfig};
use crate::ports::{
    BlobStorePort, ClockPort, EmbedderPort, FailoverEmbedder, HashEmbedder, LocalDirBlobStore,
    OpenAiCompatEmbedder, OpenAiCompatLlm, MemoryVectorStore, SeededRandom, SledStore, SystemClock,
};
use crate::scheduler::Scheduler;
use crate::sync::CurriculumPuller;
use crate::telemetry::{TelemetryPipeline, TelemetryRecorder};
use crate::vkp::{VkpManager, VkpManagerConfig};

/// Build a fully wired node from configuration.
pub async fn build_node(config: &Config) -> Result<Arc<Node>, Error> {
    let clock: Arc<dyn ClockPort> = Arc::new(SystemClock);
    let random = Arc::new(SeededRandom::from_entropy());

    std::fs::create_dir_all(&config.node.data_dir)
        .map_err(crate::error::ConfigError::Io)?;
    let relational = Arc::new(SledStore::open(config.node.data_dir.join("db"))?);
    let vector = Arc::new(MemoryVectorStore::new());
    let local_blob: Arc<dyn BlobStorePort> =
        Arc::new(LocalDirBlobStore::new(config.node.data_dir.join("blobs")));
    let remote_blob: Option<Arc<dyn BlobStorePort>> = if config.node.sovereign_mode {
        None
    } else {
        config
            .node
            .remote_root
            .as_ref()
            .map(|root| Arc::new(LocalDirBlobStore::new(root.clone())) as Arc<dyn BlobStorePort>)
    };

    let cache = Arc::new(ResponseCache::new(
        config.cache.clone(),
        None,
        clock.clone(),
    ));

    let server_embedder = Arc::new(OpenAiCompatEmbedder::new(
        config.inference.embedding_base_url.clone(),
        config.inference.embedding_model.clone(),
        config.inference.embedding_dimension,
        config.inference.api_key.clone(),
        config.inference.request_timeout,
    )?);
    let embedder: Arc<dyn EmbedderPort> = if config.inference.embedding_fallback {
        Arc::new(FailoverEmbedder::new(
            server_embedder,
            Arc::new(HashEmbedder::new(config.inference.embedding_dimension)),
        )?)
    } else {
        server_embedder
    };

    let llm = Arc::new(OpenAiCompatLlm::new(
        config.inference.llm_base_url.clone(),
        config.inference.llm_model.clone(),
        config.inference.api_key.clone(),
        config.inference.request_timeout,
    )?);

    let recorder = Arc::new(TelemetryRecorder::new(config.telemetry_ring_capacity));

    let vkp = Arc::new(VkpManager::new(
        vector.clone(),
        relational.clone(),
        cache.clone(),
        local_blob.clone(),
        embedder.clone(),
        clock.clone(),
        VkpManagerConfig::default(),
    ));
    let restored = vkp.restore_from_store().await?;
    if restored > 0 {
        tracing::info!(restored, "vector collections rebuilt from retained packages");
    }

    let pedagogy = Arc::new(MasteryTracker::new(
        relational.clone(),
        random,
        PedagogyConfig::default(),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        llm.clone(),
        embedder,
        vector.clone(),
        relational.clone(),
        cache.clone(),
        vkp.clone(),
        pedagogy.clone(),
        recorder.clone(),
        clock.clone(),
        config.orchestrator.clone(),
    ));

    let scheduler = Arc::new(Scheduler::new(
        orchestrator,
        clock.clone(),
        recorder.clone(),
        config.scheduler.clone(),
    ));

    let telemetry = Arc::new(TelemetryPipeline::new(
        recorder.clone(),
        local_blob.clone(),
        remote_blob.clone(),
        relational.clone(),
        vector.clone(),
        clock.clone(),
        config.telemetry.clone(),
    ));

    let backup = Arc::new(BackupScheduler::new(
        relational.clone(),
        vector.clone(),
        local_blob,
        clock.clone(),
        config.backup.clone(),
    )?);

    let health = Arc::new(HealthMonitor::new(
        llm,
        vector,
        relational.clone(),
        scheduler.clone(),
        telemetry.clone(),
        backup.clone(),
        config.health.clone(),
    ));

    let puller = remote_blob.map(|remote| {
        Arc::new(CurriculumPuller::new(remote, vkp.clone(), recorder.clone()))
    });

    Ok(Arc::new(Node::new(
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
    )))
}

/// Intervals for [`Node::start_background`], taken from configuration.
pub fn background_intervals(config: &Config) -> BackgroundIntervals {
    BackgroundIntervals {
        vkp_pull: config.intervals.vkp_pull_interval,
        telemetry_upload: config.intervals.telemetry_upload_interval,
        health_check: config.intervals.health_check_interval,
        backup_poll: config.intervals.backup_poll_interval,
    }
}
