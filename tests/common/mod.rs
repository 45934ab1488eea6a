//! Shared fixture: a fully wired node over a scripted LLM, the local
//! hash embedder, and tempdir-backed stores.
#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use studyhall::api::Node;
use studyhall::backup::{BackupConfig, BackupScheduler};
use studyhall::cache::{CacheConfig, ResponseCache};
use studyhall::error::{PortError, QueryError};
use studyhall::health::{HealthConfig, HealthMonitor};
use studyhall::orchestrator::OrchestratorConfig;
use studyhall::pedagogy::{MasteryTracker, PedagogyConfig};
use studyhall::orchestrator::Orchestrator;
use studyhall::ports::{
    ClockPort, EmbedderPort, GenerationRequest, HashEmbedder, LlmPort, MemoryBlobStore,
    MemoryVectorStore, SeededRandom, SledStore, SystemClock, TokenEvent, TokenStream, TokenUsage,
};
use studyhall::scheduler::{QueryHandle, Scheduler, SchedulerConfig};
use studyhall::sync::CurriculumPuller;
use studyhall::telemetry::{TelemetryConfig, TelemetryPipeline, TelemetryRecorder};
use studyhall::types::{QueryReport, StreamEvent};
use studyhall::vkp::{VkpChunk, VkpDocument, VkpManager, VkpManagerConfig, VkpManifest};

pub const DIM: usize = 32;

/// Scripted LLM with a configurable inter-token delay.
pub struct SlowLlm {
    pub tokens: Mutex<Vec<String>>,
    pub token_delay: Duration,
    pub calls: AtomicU32,
}

impl SlowLlm {
    pub fn new(tokens: &[&str], token_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            tokens: Mutex::new(tokens.iter().map(|t| t.to_string()).collect()),
            token_delay,
            calls: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl LlmPort for SlowLlm {
    fn model_name(&self) -> &str {
        "slow-scripted"
    }

    async fn stream(
        &self,
        _request: GenerationRequest,
        cancel: CancellationToken,
    ) -> Result<TokenStream, PortError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let tokens = self.tokens.lock().unwrap().clone();
        let delay = self.token_delay;
        let stream = async_stream::stream! {
            let mut emitted = 0u32;
            for token in tokens {
                if cancel.is_cancelled() {
                    break;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                emitted += 1;
                yield Ok(TokenEvent::Token(token));
            }
            yield Ok(TokenEvent::Done(TokenUsage {
                prompt_tokens: 64,
                completion_tokens: emitted,
            }));
        };
        Ok(Box::pin(stream))
    }

    async fn health(&self) -> Result<(), PortError> {
        Ok(())
    }
}

pub struct TestNode {
    pub node: Arc<Node>,
    pub store: Arc<SledStore>,
    pub recorder: Arc<TelemetryRecorder>,
    pub remote: Arc<MemoryBlobStore>,
    pub vkp: Arc<VkpManager>,
    pub llm: Arc<SlowLlm>,
    pub _dir: tempfile::TempDir,
}

/// Wire a complete node with `workers`/`queue_capacity` limits.
pub async fn test_node(workers: usize, queue_capacity: usize, llm: Arc<SlowLlm>) -> TestNode {
    let dir = tempfile::tempdir().expect("tempdir");
    let clock: Arc<dyn ClockPort> = Arc::new(SystemClock);
    let store = Arc::new(SledStore::open(dir.path().join("db")).expect("open sled"));
    let vector = Arc::new(MemoryVectorStore::new());
    let local_blob = Arc::new(MemoryBlobStore::new());
    let remote = Arc::new(MemoryBlobStore::new());
    let cache = Arc::new(ResponseCache::new(
        CacheConfig::default(),
        None,
        clock.clone(),
    ));
    let embedder: Arc<dyn EmbedderPort> = Arc::new(HashEmbedder::new(DIM));
    let recorder = Arc::new(TelemetryRecorder::new(256));

    let vkp = Arc::new(VkpManager::new(
        vector.clone(),
        store.clone(),
        cache.clone(),
        local_blob.clone(),
        embedder.clone(),
        clock.clone(),
        VkpManagerConfig::default(),
    ));
    let pedagogy = Arc::new(MasteryTracker::new(
        store.clone(),
        Arc::new(SeededRandom::new(99)),
        PedagogyConfig::default(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        llm.clone(),
        embedder,
        vector.clone(),
        store.clone(),
        cache.clone(),
        vkp.clone(),
        pedagogy.clone(),
        recorder.clone(),
        clock.clone(),
        OrchestratorConfig::default(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        orchestrator,
        clock.clone(),
        recorder.clone(),
        SchedulerConfig {
            workers,
            queue_capacity,
            stream_buffer: 64,
        },
    ));
    let telemetry = Arc::new(TelemetryPipeline::new(
        recorder.clone(),
        local_blob.clone(),
        Some(remote.clone() as Arc<dyn studyhall::ports::BlobStorePort>),
        store.clone(),
        vector.clone(),
        clock.clone(),
        TelemetryConfig::default(),
    ));
    let backup = Arc::new(
        BackupScheduler::new(
            store.clone(),
            vector.clone(),
            local_blob,
            clock.clone(),
            BackupConfig::default(),
        )
        .expect("default schedules parse"),
    );
    let health = Arc::new(HealthMonitor::new(
        llm.clone(),
        vector,
        store.clone(),
        scheduler.clone(),
        telemetry.clone(),
        backup.clone(),
        HealthConfig::default(),
    ));
    let puller = Arc::new(CurriculumPuller::new(
        remote.clone() as Arc<dyn studyhall::ports::BlobStorePort>,
        vkp.clone(),
        recorder.clone(),
    ));

    let node = Arc::new(Node::new(
        scheduler,
        cache,
        vkp.clone(),
        pedagogy,
        store.clone(),
        telemetry,
        backup,
        health,
        Some(puller),
        clock,
    ));
    node.register_user("u1", "Ayu").await.expect("register user");

    TestNode {
        node,
        store,
        recorder,
        remote,
        vkp,
        llm,
        _dir: dir,
    }
}

/// Author a valid package whose chunk embeddings match the hash embedder.
pub async fn package_bytes(
    subject: &str,
    grade: &str,
    version: &str,
    texts: &[(&str, &str)],
) -> Vec<u8> {
    let embedder = HashEmbedder::new(DIM);
    let mut chunks = Vec::new();
    for (i, (text, topic)) in texts.iter().enumerate() {
        chunks.push(VkpChunk {
            chunk_id: format!("{subject}-{version}-{i}"),
            text: text.to_string(),
            embedding: embedder.embed(text).await.expect("hash embed"),
            source_file: format!("{subject}.pdf"),
            chunk_index: i as u32,
            char_start: (i * 100) as u32,
            char_end: (i * 100 + text.len()) as u32,
            topic: Some(topic.to_string()),
        });
    }
    let manifest = VkpManifest {
        subject: subject.to_string(),
        grade: grade.to_string(),
        version: version.parse().expect("valid semver"),
        created_at: "2026-01-15T08:00:00Z".parse().unwrap(),
        embedding_model: "hash-v1".into(),
        chunk_size: 800,
        chunk_overlap: 120,
        total_chunks: chunks.len() as u32,
        source_files: vec![format!("{subject}.pdf")],
    };
    VkpDocument::sealed(manifest, chunks)
        .to_bytes()
        .expect("package serializes")
}

/// Drain a handle: concatenated token text plus the trailing report.
pub async fn collect_stream(
    handle: &mut QueryHandle,
) -> (Vec<String>, Result<QueryReport, QueryError>) {
    let mut tokens = Vec::new();
    loop {
        match handle
            .events
            .recv()
            .await
            .expect("stream terminates with End")
        {
            StreamEvent::Token(token) => tokens.push(token),
            StreamEvent::End(end) => return (tokens, *end),
        }
    }
}
