//! Request admission and dispatch.
//!
//! A fixed ceiling of W concurrent jobs, a bounded FIFO queue of depth
//! Q, and per-request cancellation. Admission is synchronous: dispatch
//! now (position 0), enqueue (1-indexed position), or reject with
//! OverCapacity. The queue drains in order as jobs finish; a queued
//! request whose deadline passes or whose token fires is completed
//! without ever running.
//!
//! Locking discipline: the scheduler state sits behind a
//! `std::sync::Mutex` that is never held across an await point; slow
//! consumers and slow processors can therefore never wedge admission.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ErrorKind, QueryError};
use crate::ports::ClockPort;
use crate::telemetry::{hour_bucket, TelemetryEvent, TelemetryRecorder};
use crate::types::{Query, QueryOutcome, QueryReport, StreamEvent};

/// Default inference parallelism ceiling.
pub const DEFAULT_WORKERS: usize = 5;
/// Default admission queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// Scheduler tunables.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Buffer of the per-request event channel.
    pub stream_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stream_buffer: 64,
        }
    }
}

/// The work a dispatched request performs.
///
/// Implementations stream tokens into `events`, honor `cancel` at the
/// next boundary, and return the outcome; the scheduler appends the
/// trailing `End` event itself.
#[async_trait]
pub trait QueryProcessor: Send + Sync {
    async fn process(
        &self,
        query: Query,
        events: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
    ) -> Result<QueryOutcome, QueryError>;
}

/// Caller-side handle for one admitted request.
pub struct QueryHandle {
    pub query_id: Uuid,
    /// 0 = dispatched immediately; otherwise 1-indexed queue position.
    pub position: usize,
    /// Tokens followed by exactly one `End`.
    pub events: mpsc::Receiver<StreamEvent>,
}

impl std::fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("query_id", &self.query_id)
            .field("position", &self.position)
            .finish()
    }
}

/// Observability counters.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStats {
    pub active: usize,
    pub queued: usize,
    pub capacity: usize,
    pub queue_capacity: usize,
    pub rejections_total: u64,
    pub cancellations_total: u64,
}

struct Pending {
    query: Query,
    position: usize,
    cancel: CancellationToken,
    events: mpsc::Sender<StreamEvent>,
}

struct SchedState {
    active: usize,
    queue: VecDeque<Pending>,
    draining: bool,
}

struct Inner {
    processor: Arc<dyn QueryProcessor>,
    clock: Arc<dyn ClockPort>,
    recorder: Arc<TelemetryRecorder>,
    state: Mutex<SchedState>,
    slots: Mutex<HashMap<Uuid, CancellationToken>>,
    rejections: AtomicU64,
    cancellations: AtomicU64,
    workers: usize,
    queue_capacity: usize,
}

impl Inner {
    /// One telemetry event per request that never reached the processor.
    fn record_unprocessed(&self, query: &Query, kind: ErrorKind) {
        let now = self.clock.now();
        let latency_ms = (now - query.submitted_at).num_milliseconds().max(0) as u64;
        self.recorder.record(TelemetryEvent {
            hour_bucket: hour_bucket(query.submitted_at),
            latency_ms,
            success: false,
            error_kind: Some(kind),
            subject_id: query.subject_id.clone(),
            vkp_version: None,
            cache_hit: false,
        });
    }
}

/// Bounded-concurrency admission over a [`QueryProcessor`].
pub struct Scheduler {
    inner: Arc<Inner>,
    stream_buffer: usize,
}

impl Scheduler {
    pub fn new(
        processor: Arc<dyn QueryProcessor>,
        clock: Arc<dyn ClockPort>,
        recorder: Arc<TelemetryRecorder>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                processor,
                clock,
                recorder,
                state: Mutex::new(SchedState {
                    active: 0,
                    queue: VecDeque::new(),
                    draining: false,
                }),
                slots: Mutex::new(HashMap::new()),
                rejections: AtomicU64::new(0),
                cancellations: AtomicU64::new(0),
                workers: config.workers.max(1),
                queue_capacity: config.queue_capacity,
            }),
            stream_buffer: config.stream_buffer.max(1),
        }
    }

    /// Admit a query: dispatch, enqueue, or reject.
    pub fn submit(&self, query: Query) -> Result<QueryHandle, QueryError> {
        let inner = &self.inner;
        let (tx, rx) = mpsc::channel(self.stream_buffer);
        let cancel = CancellationToken::new();
        let query_id = query.query_id;
        let now = inner.clock.now();

        let position = {
            let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.draining {
                drop(state);
                inner.rejections.fetch_add(1, Ordering::Relaxed);
                inner.record_unprocessed(&query, ErrorKind::Unhealthy);
                return Err(QueryError::Unhealthy);
            }
            if state.active < inner.workers {
                state.active += 1;
                // Register before the job can possibly finish and
                // deregister, or a cancel token would leak.
                self.register_slot(query_id, cancel.clone());
                drop(state);
                spawn_job(Arc::clone(inner), query, tx, cancel, 0);
                0
            } else if state.queue.len() < inner.queue_capacity {
                // A request that would wait past its deadline is refused
                // up front rather than parked.
                if query.deadline.is_some_and(|deadline| deadline <= now) {
                    drop(state);
                    inner.record_unprocessed(&query, ErrorKind::Timeout);
                    return Err(QueryError::Timeout);
                }
                let position = state.queue.len() + 1;
                self.register_slot(query_id, cancel.clone());
                state.queue.push_back(Pending {
                    query,
                    position,
                    cancel,
                    events: tx,
                });
                position
            } else {
                let queued = state.queue.len();
                drop(state);
                inner.rejections.fetch_add(1, Ordering::Relaxed);
                inner.record_unprocessed(&query, ErrorKind::OverCapacity);
                return Err(QueryError::OverCapacity { queued });
            }
        };

        Ok(QueryHandle {
            query_id,
            position,
            events: rx,
        })
    }

    /// Signal cancellation for an admitted request.
    pub fn cancel(&self, query_id: Uuid) -> Result<(), QueryError> {
        let slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        match slots.get(&query_id) {
            Some(token) => {
                token.cancel();
                Ok(())
            }
            None => Err(QueryError::UnknownQuery(query_id)),
        }
    }

    /// Enter the drain state: refuse new admissions with Unhealthy.
    pub fn drain(&self) {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        state.draining = true;
    }

    /// Whether the scheduler is refusing admissions.
    pub fn is_draining(&self) -> bool {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .draining
    }

    /// Cancel every in-flight and queued request.
    pub fn cancel_all(&self) {
        let slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        for token in slots.values() {
            token.cancel();
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        SchedulerStats {
            active: state.active,
            queued: state.queue.len(),
            capacity: self.inner.workers,
            queue_capacity: self.inner.queue_capacity,
            rejections_total: self.inner.rejections.load(Ordering::Relaxed),
            cancellations_total: self.inner.cancellations.load(Ordering::Relaxed),
        }
    }

    fn register_slot(&self, query_id: Uuid, cancel: CancellationToken) {
        let mut slots = self.inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.insert(query_id, cancel);
    }
}

fn spawn_job(
    inner: Arc<Inner>,
    query: Query,
    events: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    position: usize,
) {
    tokio::spawn(run_job(inner, query, events, cancel, position));
}

async fn run_job(
    inner: Arc<Inner>,
    query: Query,
    events: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    position: usize,
) {
    let query_id = query.query_id;
    let result = inner
        .processor
        .process(query, events.clone(), cancel)
        .await;

    let end = match result {
        Ok(outcome) => Ok(QueryReport {
            query_id,
            latency_ms: outcome.answer.latency_ms,
            cache_hit: outcome.cache_hit,
            answer: outcome.answer,
            queue_position_on_admit: position,
        }),
        Err(err) => {
            if matches!(err, QueryError::Cancelled) {
                inner.cancellations.fetch_add(1, Ordering::Relaxed);
            }
            Err(err)
        }
    };
    // A gone receiver just means the caller stopped listening.
    let _ = events.send(StreamEvent::End(Box::new(end))).await;

    {
        let mut slots = inner.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.remove(&query_id);
    }
    dispatch_next(inner);
}

/// Release the finished slot: hand it to the next runnable queued
/// request, completing cancelled or expired ones along the way.
fn dispatch_next(inner: Arc<Inner>) {
    loop {
        let next = {
            let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
            match state.queue.pop_front() {
                Some(pending) => Some(pending),
                None => {
                    state.active = state.active.saturating_sub(1);
                    None
                }
            }
        };
        let Some(pending) = next else { return };

        let now = inner.clock.now();
        if pending.cancel.is_cancelled() {
            inner.cancellations.fetch_add(1, Ordering::Relaxed);
            inner.record_unprocessed(&pending.query, ErrorKind::Cancelled);
            complete_unprocessed(&inner, pending, QueryError::Cancelled);
            continue;
        }
        if pending
            .query
            .deadline
            .is_some_and(|deadline| deadline <= now)
        {
            inner.record_unprocessed(&pending.query, ErrorKind::Timeout);
            complete_unprocessed(&inner, pending, QueryError::Timeout);
            continue;
        }

        spawn_job(
            Arc::clone(&inner),
            pending.query,
            pending.events,
            pending.cancel,
            pending.position,
        );
        return;
    }
}

/// Finish a queued request that never ran.
fn complete_unprocessed(inner: &Inner, pending: Pending, err: QueryError) {
    // The channel is untouched (no tokens were sent), so try_send only
    // fails when the caller already dropped the handle.
    let _ = pending
        .events
        .try_send(StreamEvent::End(Box::new(Err(err))));
    let mut slots = inner.slots.lock().unwrap_or_else(|e| e.into_inner());
    slots.remove(&pending.query.query_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::SystemClock;
    use crate::types::Answer;
    use chrono::Utc;
    use tokio::sync::Semaphore;

    struct GatedProcessor {
        gate: Arc<Semaphore>,
        processed: Mutex<Vec<Uuid>>,
    }

    impl GatedProcessor {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                gate: Arc::new(Semaphore::new(0)),
                processed: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl QueryProcessor for GatedProcessor {
        async fn process(
            &self,
            query: Query,
            _events: mpsc::Sender<StreamEvent>,
            cancel: CancellationToken,
        ) -> Result<QueryOutcome, QueryError> {
            tokio::select! {
                _ = cancel.cancelled() => Err(QueryError::Cancelled),
                permit = self.gate.acquire() => {
                    permit.expect("gate open").forget();
                    self.processed
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .push(query.query_id);
                    Ok(QueryOutcome {
                        answer: Answer {
                            text: "ok".into(),
                            confidence: 0.5,
                            sources: Vec::new(),
                            token_count: 1,
                            latency_ms: 1,
                        },
                        cache_hit: false,
                    })
                }
            }
        }
    }

    fn scheduler(processor: Arc<GatedProcessor>, workers: usize, depth: usize) -> Scheduler {
        Scheduler::new(
            processor,
            Arc::new(SystemClock),
            Arc::new(TelemetryRecorder::new(64)),
            SchedulerConfig {
                workers,
                queue_capacity: depth,
                stream_buffer: 8,
            },
        )
    }

    fn query(deadline_ms: Option<i64>) -> Query {
        let now = Utc::now();
        Query {
            query_id: Uuid::new_v4(),
            user_id: "u1".into(),
            subject_id: "math".into(),
            question: "What is a fraction?".into(),
            submitted_at: now,
            deadline: deadline_ms.map(|ms| now + chrono::Duration::milliseconds(ms)),
        }
    }

    async fn wait_end(handle: &mut QueryHandle) -> Result<QueryReport, QueryError> {
        loop {
            match handle.events.recv().await.expect("stream ends with End") {
                StreamEvent::Token(_) => continue,
                StreamEvent::End(end) => return *end,
            }
        }
    }

    #[tokio::test]
    async fn admission_positions_and_over_capacity() {
        let processor = GatedProcessor::new();
        let sched = scheduler(processor.clone(), 2, 2);

        let h1 = sched.submit(query(None)).unwrap();
        let h2 = sched.submit(query(None)).unwrap();
        let h3 = sched.submit(query(None)).unwrap();
        let h4 = sched.submit(query(None)).unwrap();
        assert_eq!(
            [h1.position, h2.position, h3.position, h4.position],
            [0, 0, 1, 2]
        );

        let err = sched.submit(query(None)).unwrap_err();
        assert!(matches!(err, QueryError::OverCapacity { .. }));
        assert_eq!(sched.stats().rejections_total, 1);
        assert_eq!(sched.stats().active, 2);
        assert_eq!(sched.stats().queued, 2);

        // Open the gate and let everything finish.
        processor.gate.add_permits(4);
        for mut h in [h1, h2, h3, h4] {
            wait_end(&mut h).await.unwrap();
        }
        assert_eq!(sched.stats().active, 0);
        assert_eq!(sched.stats().queued, 0);
    }

    #[tokio::test]
    async fn queue_drains_in_fifo_order() {
        let processor = GatedProcessor::new();
        let sched = scheduler(processor.clone(), 1, 10);

        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(sched.submit(query(None)).unwrap());
        }
        let submitted: Vec<Uuid> = handles.iter().map(|h| h.query_id).collect();

        processor.gate.add_permits(5);
        for handle in &mut handles {
            wait_end(handle).await.unwrap();
        }

        let processed = processor
            .processed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        assert_eq!(processed, submitted);
    }

    #[tokio::test]
    async fn cancelling_a_queued_request_skips_execution() {
        let processor = GatedProcessor::new();
        let sched = scheduler(processor.clone(), 1, 10);

        let mut running = sched.submit(query(None)).unwrap();
        let mut queued = sched.submit(query(None)).unwrap();
        sched.cancel(queued.query_id).unwrap();

        processor.gate.add_permits(2);
        wait_end(&mut running).await.unwrap();
        let err = wait_end(&mut queued).await.unwrap_err();
        assert!(matches!(err, QueryError::Cancelled));

        let processed = processor
            .processed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        assert_eq!(processed, vec![running.query_id]);
        assert_eq!(sched.stats().cancellations_total, 1);
    }

    #[tokio::test]
    async fn expired_deadline_in_queue_times_out_without_running() {
        let processor = GatedProcessor::new();
        let sched = scheduler(processor.clone(), 1, 10);

        let mut running = sched.submit(query(None)).unwrap();
        // Deadline in the past relative to when the queue drains.
        let mut queued = sched.submit(query(Some(20))).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        processor.gate.add_permits(2);
        wait_end(&mut running).await.unwrap();
        let err = wait_end(&mut queued).await.unwrap_err();
        assert!(matches!(err, QueryError::Timeout));
    }

    #[tokio::test]
    async fn zero_deadline_with_busy_pool_is_immediate_timeout() {
        let processor = GatedProcessor::new();
        let sched = scheduler(processor.clone(), 1, 10);

        let _running = sched.submit(query(None)).unwrap();
        let err = sched.submit(query(Some(0))).unwrap_err();
        assert!(matches!(err, QueryError::Timeout));
    }

    #[tokio::test]
    async fn drain_rejects_with_unhealthy() {
        let processor = GatedProcessor::new();
        let sched = scheduler(processor.clone(), 1, 10);
        sched.drain();
        let err = sched.submit(query(None)).unwrap_err();
        assert!(matches!(err, QueryError::Unhealthy));
        assert!(sched.is_draining());
    }

    #[tokio::test]
    async fn unknown_query_cancel_errors() {
        let processor = GatedProcessor::new();
        let sched = scheduler(processor, 1, 10);
        let err = sched.cancel(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, QueryError::UnknownQuery(_)));
    }
}
