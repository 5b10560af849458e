use dashmap::DashMap;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::backend::InferenceBackend;
use crate::error::BenchError;
use crate::metrics::Metrics;
use crate::router::{
    EventKind, EventPayload, EventRouter, Failure, Generation, RoutedEvent, Subject, SubmissionId,
    Token,
};
use crate::types::{RunId, Task};

const DEFAULT_CONCURRENCY: usize = 2;
const DEFAULT_CALL_TIMEOUT_SECS: u64 = 600;
const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 30;

const QUEUED: u8 = 0;
const RUNNING: u8 = 1;
const CANCELLED: u8 = 2;
const DONE: u8 = 3;

struct Submission {
    id: SubmissionId,
    run_id: RunId,
    model: String,
    task: Arc<Task>,
    state: AtomicU8,
}

impl Submission {
    fn transition(&self, from: u8, to: u8) -> bool {
        self.state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn begin(&self) -> bool {
        self.transition(QUEUED, RUNNING)
    }

    fn cancel(&self) -> bool {
        self.transition(QUEUED, CANCELLED)
    }

    fn is(&self, state: u8) -> bool {
        self.state.load(Ordering::Acquire) == state
    }

    fn failure(&self, err: &BenchError) -> EventPayload {
        EventPayload::Failure(Failure {
            run_id: self.run_id,
            model: Some(self.model.clone()),
            task_id: Some(self.task.id.clone()),
            code: err.code().to_string(),
            message: err.to_string(),
        })
    }

    fn dropped(&self) -> EventPayload {
        EventPayload::Dropped {
            run_id: self.run_id,
            model: self.model.clone(),
            task_id: self.task.id.clone(),
        }
    }
}

/// Dispatches (model, task) generation jobs onto a semaphore-bounded pool.
///
/// Every submission ends with exactly one terminal event on its subject:
/// `Completed`, `Error` or `Dropped`. Streaming chunks precede it.
pub struct Scheduler {
    backend: Arc<dyn InferenceBackend>,
    router: EventRouter,
    metrics: Arc<Metrics>,
    permits: Arc<Semaphore>,
    concurrency: usize,
    call_timeout: Duration,
    health_timeout: Duration,
    next_id: AtomicU64,
    pending: Arc<DashMap<SubmissionId, Arc<Submission>>>,
}

impl Scheduler {
    pub fn new(backend: Arc<dyn InferenceBackend>, router: EventRouter, metrics: Arc<Metrics>) -> Self {
        Self {
            backend,
            router,
            metrics,
            permits: Arc::new(Semaphore::new(DEFAULT_CONCURRENCY)),
            concurrency: DEFAULT_CONCURRENCY,
            call_timeout: Duration::from_secs(DEFAULT_CALL_TIMEOUT_SECS),
            health_timeout: Duration::from_secs(DEFAULT_HEALTH_TIMEOUT_SECS),
            next_id: AtomicU64::new(1),
            pending: Arc::new(DashMap::new()),
        }
    }

    pub fn with_concurrency(mut self, max: usize) -> Self {
        let max = max.max(1);
        self.concurrency = max;
        self.permits = Arc::new(Semaphore::new(max));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn available_slots(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn queued(&self) -> usize {
        self.pending.iter().filter(|s| s.is(QUEUED)).count()
    }

    pub fn in_flight(&self) -> usize {
        self.pending.iter().filter(|s| s.is(RUNNING)).count()
    }

    pub fn submit(&self, run_id: RunId, task: Arc<Task>, model: &str) -> SubmissionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let submission = Arc::new(Submission {
            id,
            run_id,
            model: model.to_string(),
            task,
            state: AtomicU8::new(QUEUED),
        });
        self.pending.insert(id, submission.clone());
        self.metrics.submitted();
        debug!(
            submission_id = id,
            run_id,
            model = %submission.model,
            task_id = %submission.task.id,
            "Submission queued"
        );

        let worker = Worker {
            backend: self.backend.clone(),
            router: self.router.clone(),
            call_timeout: self.call_timeout,
            health_timeout: self.health_timeout,
        };
        let permits = self.permits.clone();
        let pending = self.pending.clone();
        let router = self.router.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let _permit = match permits.acquire_owned().await {
                Ok(p) => p,
                Err(_) => {
                    if submission.cancel() {
                        metrics.dropped();
                        router.emit(Subject::Submission(id), EventKind::Dropped, submission.dropped());
                    }
                    pending.remove(&id);
                    return;
                }
            };
            if !submission.begin() {
                // Cancelled while queued; the canceller already emitted DROPPED.
                return;
            }

            let outcome = AssertUnwindSafe(worker.execute(&submission)).catch_unwind().await;
            if outcome.is_err() {
                error!(submission_id = id, "Worker panicked");
                let err = BenchError::Inference("worker panicked".into());
                router.emit(Subject::Submission(id), EventKind::Error, submission.failure(&err));
            }
            submission.state.store(DONE, Ordering::Release);
            pending.remove(&id);
        });

        id
    }

    /// Drops every not-yet-started submission of `run_id`. In-flight jobs are
    /// left to finish. Returns the number of dropped submissions.
    pub fn cancel_pending(&self, run_id: RunId) -> usize {
        let cancelled: Vec<Arc<Submission>> = self
            .pending
            .iter()
            .filter(|s| s.run_id == run_id)
            .map(|s| s.value().clone())
            .filter(|s| s.cancel())
            .collect();

        for submission in &cancelled {
            self.pending.remove(&submission.id);
            self.metrics.dropped();
            self.router.emit(
                Subject::Submission(submission.id),
                EventKind::Dropped,
                submission.dropped(),
            );
        }

        if !cancelled.is_empty() {
            info!(run_id, dropped = cancelled.len(), "Dropped queued submissions");
        }
        cancelled.len()
    }

    /// Events emitted before the subscription exists are not replayed.
    pub fn subscribe<F>(&self, submission_id: SubmissionId, kind: EventKind, callback: F) -> Token
    where
        F: Fn(&RoutedEvent) + Send + Sync + 'static,
    {
        self.router
            .register(Subject::Submission(submission_id), kind, callback)
    }

    pub fn unsubscribe(&self, token: Token) {
        self.router.unregister(token);
    }
}

struct Worker {
    backend: Arc<dyn InferenceBackend>,
    router: EventRouter,
    call_timeout: Duration,
    health_timeout: Duration,
}

impl Worker {
    async fn check_ready(&self, model: &str) -> Result<(), BenchError> {
        match tokio::time::timeout(self.health_timeout, self.backend.health_check(model)).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(BenchError::BackendUnavailable(format!(
                "model {} is not reachable",
                model
            ))),
            Err(_) => Err(BenchError::BackendUnavailable(format!(
                "health check for {} timed out after {}s",
                model,
                self.health_timeout.as_secs()
            ))),
        }
    }

    async fn execute(&self, s: &Submission) {
        let subject = Subject::Submission(s.id);

        if let Err(e) = self.check_ready(&s.model).await {
            warn!(submission_id = s.id, model = %s.model, error = %e, "Backend not ready");
            self.router.emit(subject, EventKind::Error, s.failure(&e));
            return;
        }

        let started = Instant::now();
        let mut text = String::new();
        let outcome = {
            let router = &self.router;
            let mut on_token = |chunk: &str| {
                text.push_str(chunk);
                router.emit(
                    subject,
                    EventKind::StreamingResult,
                    EventPayload::Chunk {
                        run_id: s.run_id,
                        model: s.model.clone(),
                        task_id: s.task.id.clone(),
                        text: chunk.to_string(),
                    },
                );
            };
            tokio::time::timeout(
                self.call_timeout,
                self.backend
                    .stream_generate(&s.model, &s.task.prompt, &mut on_token),
            )
            .await
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(Ok(stats)) => {
                debug!(
                    submission_id = s.id,
                    model = %s.model,
                    task_id = %s.task.id,
                    elapsed_ms,
                    tokens = stats.tokens(),
                    "Generation completed"
                );
                self.router.emit(
                    subject,
                    EventKind::Completed,
                    EventPayload::Generation(Generation {
                        run_id: s.run_id,
                        model: s.model.clone(),
                        task_id: s.task.id.clone(),
                        response: text,
                        elapsed_ms,
                        tokens: stats.tokens(),
                    }),
                );
            }
            Ok(Err(e)) => {
                warn!(submission_id = s.id, model = %s.model, error = %e, "Generation failed");
                self.router.emit(subject, EventKind::Error, s.failure(&e));
            }
            Err(_) => {
                let e = BenchError::Timeout(self.call_timeout.as_secs());
                warn!(submission_id = s.id, model = %s.model, "Generation timed out");
                self.router.emit(subject, EventKind::Error, s.failure(&e));
            }
        }
    }
}
