//! The RAG pipeline: cache probe, embed, retrieve, assemble, stream,
//! persist.
//!
//! One orchestration runs per scheduler slot; the orchestrator itself
//! holds no mutable state beyond what the ports mediate, so it is
//! freely reentrant. Cancellation and deadline are enforced around the
//! streaming phases; once the full response has been generated, the
//! side-effect phase (one transaction with the chat row and mastery
//! delta, then the cache write) runs to completion.
//!
//! Side effects on the miss path only; a cache hit re-streams the
//! stored answer and touches no pedagogy state. Failed or cancelled
//! requests leave exactly one telemetry event behind.

pub mod prompt;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::{compose_key, ResponseCache};
use crate::error::{PortError, QueryError};
use crate::pedagogy::MasteryTracker;
use crate::ports::{
    ChatRecord, ClockPort, EmbedderPort, GenerationRequest, LlmPort, RelationalStorePort,
    RelationalTx, ScoredChunk, TokenEvent, VectorStorePort,
};
use crate::scheduler::QueryProcessor;
use crate::telemetry::{hour_bucket, TelemetryEvent, TelemetryRecorder};
use crate::types::{Answer, Query, QueryOutcome, SourceRef, StreamEvent};
use crate::vkp::VkpManager;

/// Answer served when a subject has no curriculum chunks at all.
pub const NO_CONTEXT_ANSWER: &str = "I don't have curriculum material for this question yet. \
Your school's content for this subject may still be syncing. Please ask your teacher, or try \
another subject.";

/// Version label used in cache keys before any package is installed.
const UNVERSIONED: &str = "unversioned";

/// Map the top retrieval similarity to an answer confidence.
///
/// Pinned mapping: `clamp(0.2 + 0.75 * clamp(s, 0, 1), 0, 1)`. Monotone
/// in `s`, lands in (0, 1] whenever at least one chunk was retrieved.
/// Zero-context answers get 0.0 directly.
pub fn confidence_from_similarity(top_similarity: f32) -> f32 {
    (0.2 + 0.75 * top_similarity.clamp(0.0, 1.0)).clamp(0.0, 1.0)
}

/// Orchestrator tunables.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Chunks requested from the vector store.
    pub top_k: usize,
    /// Hard ceiling on generated tokens per response.
    pub max_tokens: u32,
    /// Model context window, in tokens.
    pub context_window: u32,
    pub temperature: f32,
    pub stop: Vec<String>,
    /// Backoff before the single permitted retry of a transient failure.
    pub retry_backoff: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            max_tokens: 512,
            context_window: 4096,
            temperature: 0.2,
            stop: Vec::new(),
            retry_backoff: Duration::from_millis(200),
        }
    }
}

/// What the streaming phases produced, before side effects run.
enum Streamed {
    CacheHit {
        answer: Answer,
    },
    Generated {
        answer: Answer,
        cache_key: String,
        /// Dominant topic of the kept chunks, when one resolved.
        topic: Option<String>,
    },
}

/// Drives one admitted query through the full pipeline.
pub struct Orchestrator {
    llm: Arc<dyn LlmPort>,
    embedder: Arc<dyn EmbedderPort>,
    vector: Arc<dyn VectorStorePort>,
    relational: Arc<dyn RelationalStorePort>,
    cache: Arc<ResponseCache>,
    vkp: Arc<VkpManager>,
    pedagogy: Arc<MasteryTracker>,
    recorder: Arc<TelemetryRecorder>,
    clock: Arc<dyn ClockPort>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        llm: Arc<dyn LlmPort>,
        embedder: Arc<dyn EmbedderPort>,
        vector: Arc<dyn VectorStorePort>,
        relational: Arc<dyn RelationalStorePort>,
        cache: Arc<ResponseCache>,
        vkp: Arc<VkpManager>,
        pedagogy: Arc<MasteryTracker>,
        recorder: Arc<TelemetryRecorder>,
        clock: Arc<dyn ClockPort>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            llm,
            embedder,
            vector,
            relational,
            cache,
            vkp,
            pedagogy,
            recorder,
            clock,
            config,
        }
    }

    fn active_version_label(&self, subject_id: &str) -> String {
        self.vkp
            .active_version(subject_id)
            .map(|v| v.to_string())
            .unwrap_or_else(|| UNVERSIONED.to_string())
    }

    fn elapsed_ms(&self, since: chrono::DateTime<chrono::Utc>) -> u64 {
        (self.clock.now() - since).num_milliseconds().max(0) as u64
    }

    /// Streaming phases: cache probe, embed, retrieve, assemble, generate.
    async fn run_pipeline(
        &self,
        query: &Query,
        events: &mpsc::Sender<StreamEvent>,
        cancel: &CancellationToken,
    ) -> Result<Streamed, QueryError> {
        let started = self.clock.now();
        let version = self.active_version_label(&query.subject_id);
        let cache_key = compose_key(&query.question, &query.subject_id, &version);

        if let Some(mut answer) = self.cache.get(&cache_key).await {
            // Re-stream the stored body as a single chunk.
            let _ = events.send(StreamEvent::Token(answer.text.clone())).await;
            answer.latency_ms = self.elapsed_ms(started);
            return Ok(Streamed::CacheHit { answer });
        }

        let embedding = with_single_retry(self.config.retry_backoff, "embedder", || {
            self.embedder.embed(&query.question)
        })
        .await?;

        let retrieved = self
            .vector
            .top_k(&query.subject_id, &embedding, self.config.top_k)
            .await
            .map_err(|e| QueryError::from_port("vector_store", e))?;

        if retrieved.is_empty() {
            // No curriculum context: canned answer, no LLM call.
            let _ = events
                .send(StreamEvent::Token(NO_CONTEXT_ANSWER.to_string()))
                .await;
            let answer = Answer {
                text: NO_CONTEXT_ANSWER.to_string(),
                confidence: 0.0,
                sources: Vec::new(),
                token_count: 0,
                latency_ms: self.elapsed_ms(started),
            };
            return Ok(Streamed::Generated {
                answer,
                cache_key,
                topic: None,
            });
        }

        let plan = prompt::assemble(
            &query.question,
            retrieved,
            self.config.context_window,
            self.config.max_tokens,
        );
        let topic = dominant_topic(&plan.kept);
        let top_similarity = plan.kept.first().map(|c| c.similarity).unwrap_or(0.0);
        let sources: Vec<SourceRef> = plan
            .kept
            .iter()
            .map(|c| SourceRef {
                chunk_id: c.chunk_id.clone(),
                document: c.metadata.source_file.clone(),
                similarity: c.similarity,
            })
            .collect();

        let request = GenerationRequest {
            prompt: plan.prompt,
            max_tokens: self.config.max_tokens,
            stop: self.config.stop.clone(),
            temperature: self.config.temperature,
        };
        let mut stream = with_single_retry(self.config.retry_backoff, "llm", || {
            self.llm.stream(request.clone(), cancel.clone())
        })
        .await?;

        let mut text = String::new();
        let mut forwarded = 0u32;
        let mut usage_tokens = None;
        while let Some(event) = stream.next().await {
            match event {
                Ok(TokenEvent::Token(token)) => {
                    text.push_str(&token);
                    forwarded += 1;
                    let _ = events.send(StreamEvent::Token(token)).await;
                    if forwarded >= self.config.max_tokens {
                        // Hard ceiling regardless of backend behavior.
                        break;
                    }
                }
                Ok(TokenEvent::Done(usage)) => {
                    usage_tokens = Some(usage.completion_tokens);
                    break;
                }
                // Mid-stream failures are never retried: tokens already
                // reached the client, the stream is marked incomplete.
                Err(err) => return Err(QueryError::from_port("llm", err)),
            }
        }

        let answer = Answer {
            text,
            confidence: confidence_from_similarity(top_similarity),
            sources,
            token_count: usage_tokens.unwrap_or(forwarded),
            latency_ms: self.elapsed_ms(started),
        };
        Ok(Streamed::Generated {
            answer,
            cache_key,
            topic,
        })
    }

    /// Miss-path side effects: chat row and mastery delta in one
    /// transaction, then the cache write.
    async fn persist(
        &self,
        query: &Query,
        answer: &Answer,
        topic: Option<&str>,
    ) -> Result<(), QueryError> {
        let now = self.clock.now();
        let mut tx = self
            .relational
            .begin()
            .await
            .map_err(|e| QueryError::from_port("relational_store", e))?;

        tx.insert_chat(ChatRecord {
            chat_id: query.query_id,
            user_id: query.user_id.clone(),
            subject_id: query.subject_id.clone(),
            question: query.question.clone(),
            response: answer.text.clone(),
            confidence: answer.confidence,
            created_at: now,
        });

        match topic {
            Some(topic) => {
                self.pedagogy
                    .observe_answer(tx.as_mut(), &query.user_id, &query.subject_id, topic, None, now)
                    .await
                    .map_err(|e| QueryError::from_port("relational_store", e))?;
            }
            None => {
                self.recorder.note_topic_unresolved();
                tracing::debug!(query_id = %query.query_id, "no topic resolved, skipping mastery update");
            }
        }

        tx.commit()
            .await
            .map_err(|e| QueryError::from_port("relational_store", e))
    }
}

#[async_trait]
impl QueryProcessor for Orchestrator {
    async fn process(
        &self,
        query: Query,
        events: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Result<QueryOutcome, QueryError> {
        let started = self.clock.now();

        // Cancellation and deadline abort the streaming phases at the
        // next boundary; the side-effect phase below is not abortable.
        let streamed = tokio::select! {
            // Cancellation and deadline outrank a pipeline that happens
            // to be ready on the same poll.
            biased;
            _ = cancel.cancelled() => Err(QueryError::Cancelled),
            _ = deadline_sleep(self.clock.as_ref(), query.deadline) => Err(QueryError::Timeout),
            result = self.run_pipeline(&query, &events, &cancel) => result,
        };

        let result = match streamed {
            Ok(Streamed::CacheHit { answer }) => Ok(QueryOutcome {
                answer,
                cache_hit: true,
            }),
            Ok(Streamed::Generated {
                answer,
                cache_key,
                topic,
            }) => match self.persist(&query, &answer, topic.as_deref()).await {
                Ok(()) => {
                    self.cache.put(&cache_key, answer.clone()).await;
                    Ok(QueryOutcome {
                        answer,
                        cache_hit: false,
                    })
                }
                Err(err) => Err(err),
            },
            Err(err) => Err(err),
        };

        let (success, error_kind, cache_hit, latency_ms) = match &result {
            Ok(outcome) => (true, None, outcome.cache_hit, outcome.answer.latency_ms),
            Err(err) => (false, Some(err.kind()), false, self.elapsed_ms(started)),
        };
        self.recorder.record(TelemetryEvent {
            hour_bucket: hour_bucket(query.submitted_at),
            latency_ms,
            success,
            error_kind,
            subject_id: query.subject_id.clone(),
            vkp_version: self.vkp.active_version(&query.subject_id).map(|v| v.to_string()),
            cache_hit,
        });

        result
    }
}

/// The dominant topic: the highest-similarity kept chunk that carries a
/// non-empty topic label. Kept chunks arrive in retrieval (descending
/// similarity) order.
fn dominant_topic(kept: &[ScoredChunk]) -> Option<String> {
    kept.iter()
        .filter_map(|c| c.metadata.topic.as_deref())
        .find(|t| !t.is_empty())
        .map(|t| t.to_string())
}

/// Sleep until the deadline; pends forever when there is none.
async fn deadline_sleep(clock: &dyn ClockPort, deadline: Option<chrono::DateTime<chrono::Utc>>) {
    match deadline {
        Some(deadline) => {
            let remaining = (deadline - clock.now())
                .to_std()
                .unwrap_or(Duration::ZERO);
            tokio::time::sleep(remaining).await;
        }
        None => futures::future::pending::<()>().await,
    }
}

/// Call a port, retrying exactly once on a transient failure.
async fn with_single_retry<T, F, Fut>(
    backoff: Duration,
    port: &'static str,
    mut call: F,
) -> Result<T, QueryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PortError>>,
{
    match call().await {
        Ok(value) => Ok(value),
        Err(err) if err.is_transient() => {
            tracing::debug!(port, error = %err, "transient port failure, retrying once");
            tokio::time::sleep(backoff).await;
            call().await.map_err(|e| QueryError::from_port(port, e))
        }
        Err(err) => Err(QueryError::from_port(port, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::pedagogy::PedagogyConfig;
    use crate::ports::{
        HashEmbedder, MemoryBlobStore, MemoryVectorStore, SeededRandom, SledStore, SystemClock,
        TokenStream, TokenUsage,
    };
    use crate::scheduler::{Scheduler, SchedulerConfig};
    use crate::vkp::package::test_support::make_package;
    use crate::vkp::VkpManagerConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    const DIM: usize = 32;

    /// Scripted LLM: streams the configured tokens, optionally failing
    /// the first N stream() calls with an overload.
    struct ScriptedLlm {
        tokens: Vec<&'static str>,
        overloads_remaining: AtomicU32,
        calls: AtomicU32,
    }

    impl ScriptedLlm {
        fn new(tokens: Vec<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                tokens,
                overloads_remaining: AtomicU32::new(0),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl LlmPort for ScriptedLlm {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn stream(
            &self,
            _request: GenerationRequest,
            _cancel: CancellationToken,
        ) -> Result<TokenStream, PortError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self
                .overloads_remaining
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(PortError::Overloaded {
                    port: "llm",
                    retry_after: None,
                });
            }
            let tokens = self.tokens.clone();
            let count = tokens.len() as u32;
            let stream = async_stream::stream! {
                for token in tokens {
                    yield Ok(TokenEvent::Token(token.to_string()));
                }
                yield Ok(TokenEvent::Done(TokenUsage {
                    prompt_tokens: 50,
                    completion_tokens: count,
                }));
            };
            Ok(Box::pin(stream))
        }

        async fn health(&self) -> Result<(), PortError> {
            Ok(())
        }
    }

    struct Fixture {
        orchestrator: Arc<Orchestrator>,
        scheduler: Scheduler,
        store: Arc<SledStore>,
        cache: Arc<ResponseCache>,
        recorder: Arc<TelemetryRecorder>,
        vkp: Arc<VkpManager>,
        llm: Arc<ScriptedLlm>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(tokens: Vec<&'static str>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let clock: Arc<dyn ClockPort> = Arc::new(SystemClock);
        let store = Arc::new(SledStore::open(dir.path().join("db")).unwrap());
        let vector = Arc::new(MemoryVectorStore::new());
        let cache = Arc::new(ResponseCache::new(
            CacheConfig::default(),
            None,
            clock.clone(),
        ));
        let embedder = Arc::new(HashEmbedder::new(DIM));
        let recorder = Arc::new(TelemetryRecorder::new(128));
        let vkp = Arc::new(VkpManager::new(
            vector.clone(),
            store.clone(),
            cache.clone(),
            Arc::new(MemoryBlobStore::new()),
            embedder.clone(),
            clock.clone(),
            VkpManagerConfig::default(),
        ));
        let pedagogy = Arc::new(MasteryTracker::new(
            store.clone(),
            Arc::new(SeededRandom::new(3)),
            PedagogyConfig::default(),
        ));
        let llm = ScriptedLlm::new(tokens);
        let orchestrator = Arc::new(Orchestrator::new(
            llm.clone(),
            embedder,
            vector,
            store.clone(),
            cache.clone(),
            vkp.clone(),
            pedagogy,
            recorder.clone(),
            clock.clone(),
            OrchestratorConfig::default(),
        ));
        let scheduler = Scheduler::new(
            orchestrator.clone(),
            clock,
            recorder.clone(),
            SchedulerConfig::default(),
        );
        Fixture {
            orchestrator,
            scheduler,
            store,
            cache,
            recorder,
            vkp,
            llm,
            _dir: dir,
        }
    }

    fn query(question: &str) -> Query {
        Query {
            query_id: Uuid::new_v4(),
            user_id: "u1".into(),
            subject_id: "math".into(),
            question: question.into(),
            submitted_at: chrono::Utc::now(),
            deadline: None,
        }
    }

    async fn install_math(fx: &Fixture) {
        let pkg = make_package(
            "math",
            "5",
            "1.0.0",
            DIM,
            &[("recursion is a function calling itself", "recursion")],
        );
        fx.vkp
            .install("math", "5", &pkg.to_bytes().unwrap())
            .await
            .unwrap();
    }

    #[test]
    fn confidence_mapping_is_pinned() {
        assert!((confidence_from_similarity(0.0) - 0.2).abs() < 1e-6);
        assert!((confidence_from_similarity(1.0) - 0.95).abs() < 1e-6);
        assert!((confidence_from_similarity(2.0) - 0.95).abs() < 1e-6);
        assert!((confidence_from_similarity(-1.0) - 0.2).abs() < 1e-6);
        assert!(confidence_from_similarity(0.8) > confidence_from_similarity(0.3));
    }

    #[tokio::test]
    async fn miss_path_streams_persists_and_caches() {
        let fx = fixture(vec!["Recursion ", "is ", "self-reference."]).await;
        install_math(&fx).await;

        let (tx, mut rx) = mpsc::channel(16);
        let outcome = fx
            .orchestrator
            .process(query("What is recursion?"), tx, CancellationToken::new())
            .await
            .unwrap();

        assert!(!outcome.cache_hit);
        assert_eq!(outcome.answer.text, "Recursion is self-reference.");
        assert_eq!(outcome.answer.sources.len(), 1);
        assert!(outcome.answer.confidence > 0.0 && outcome.answer.confidence <= 1.0);
        assert_eq!(outcome.answer.token_count, 3);

        // Tokens were forwarded in generation order.
        let mut streamed = String::new();
        while let Ok(event) = rx.try_recv() {
            if let StreamEvent::Token(t) = event {
                streamed.push_str(&t);
            }
        }
        assert_eq!(streamed, outcome.answer.text);

        // One chat row, one mastery row, one telemetry event, one cache entry.
        assert_eq!(fx.store.chat_count().await.unwrap(), 1);
        let mastery = fx.store.list_mastery("u1", "math").await.unwrap();
        assert_eq!(mastery.len(), 1);
        assert_eq!(mastery[0].topic, "recursion");
        assert_eq!(fx.recorder.len(), 1);
        assert_eq!(fx.cache.stats().await.key_count, 1);
    }

    #[tokio::test]
    async fn cache_hit_skips_pedagogy() {
        let fx = fixture(vec!["Answer."]).await;
        install_math(&fx).await;

        let (tx, _rx) = mpsc::channel(16);
        fx.orchestrator
            .process(query("What is recursion?"), tx, CancellationToken::new())
            .await
            .unwrap();
        let mastery_before = fx.store.list_mastery("u1", "math").await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let outcome = fx
            .orchestrator
            // Case and whitespace changes still hit.
            .process(query("  WHAT IS RECURSION?  "), tx, CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.cache_hit);
        assert_eq!(outcome.answer.text, "Answer.");
        // The whole body arrives as a single chunk.
        match rx.try_recv().unwrap() {
            StreamEvent::Token(t) => assert_eq!(t, "Answer."),
            other => panic!("expected token, got {other:?}"),
        }
        // Pedagogy unchanged, no second chat row, exactly one LLM call.
        assert_eq!(
            fx.store.list_mastery("u1", "math").await.unwrap(),
            mastery_before
        );
        assert_eq!(fx.store.chat_count().await.unwrap(), 1);
        assert_eq!(fx.llm.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn empty_retrieval_produces_canned_answer_without_llm() {
        let fx = fixture(vec!["never"]).await;
        // No package installed: subject has zero chunks.

        let (tx, _rx) = mpsc::channel(16);
        let outcome = fx
            .orchestrator
            .process(query("What is recursion?"), tx, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome.answer.text, NO_CONTEXT_ANSWER);
        assert_eq!(outcome.answer.confidence, 0.0);
        assert_eq!(fx.llm.calls.load(Ordering::Relaxed), 0);
        // Success path still persists the chat and emits telemetry.
        assert_eq!(fx.store.chat_count().await.unwrap(), 1);
        assert_eq!(fx.recorder.len(), 1);
        // Topic unresolved: mastery untouched, counter bumped.
        assert!(fx.store.list_mastery("u1", "math").await.unwrap().is_empty());
        assert_eq!(fx.recorder.counters().topic_unresolved, 1);
    }

    #[tokio::test]
    async fn transient_llm_overload_is_retried_once() {
        let fx = fixture(vec!["ok"]).await;
        install_math(&fx).await;
        fx.llm.overloads_remaining.store(1, Ordering::Relaxed);

        let (tx, _rx) = mpsc::channel(16);
        let outcome = fx
            .orchestrator
            .process(query("What is recursion?"), tx, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.answer.text, "ok");
        assert_eq!(fx.llm.calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn persistent_overload_fails_after_one_retry() {
        let fx = fixture(vec!["ok"]).await;
        install_math(&fx).await;
        fx.llm.overloads_remaining.store(10, Ordering::Relaxed);

        let (tx, _rx) = mpsc::channel(16);
        let err = fx
            .orchestrator
            .process(query("What is recursion?"), tx, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::DependencyUnavailable { .. }));
        assert_eq!(fx.llm.calls.load(Ordering::Relaxed), 2);

        // Failure leaves only the telemetry event behind.
        assert_eq!(fx.store.chat_count().await.unwrap(), 0);
        assert_eq!(fx.cache.stats().await.key_count, 0);
        assert_eq!(fx.recorder.len(), 1);
        let events = fx.recorder.drain();
        assert_eq!(
            events[0].error_kind,
            Some(crate::error::ErrorKind::DependencyUnavailable)
        );
    }

    #[tokio::test]
    async fn pre_cancelled_request_has_no_side_effects() {
        let fx = fixture(vec!["never"]).await;
        install_math(&fx).await;

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = mpsc::channel(16);
        let err = fx
            .orchestrator
            .process(query("What is recursion?"), tx, cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, QueryError::Cancelled));
        assert_eq!(fx.store.chat_count().await.unwrap(), 0);
        let events = fx.recorder.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].error_kind, Some(crate::error::ErrorKind::Cancelled));
    }

    #[tokio::test]
    async fn scheduler_end_to_end_reports_position() {
        let fx = fixture(vec!["hi"]).await;
        install_math(&fx).await;

        let mut handle = fx.scheduler.submit(query("What is recursion?")).unwrap();
        assert_eq!(handle.position, 0);
        let report = loop {
            match handle.events.recv().await.unwrap() {
                StreamEvent::Token(_) => continue,
                StreamEvent::End(end) => break end,
            }
        };
        let report = report.unwrap();
        assert_eq!(report.queue_position_on_admit, 0);
        assert!(!report.cache_hit);
    }
}
