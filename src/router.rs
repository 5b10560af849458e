//! Event routing between worker tasks and the single consumer context.
//!
//! Producers call [`EventRouter::emit`], which only enqueues onto an unbounded
//! channel. One consumer task drains the channel and runs the registered
//! callbacks sequentially, in enqueue order.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::types::{Progress, ResultStatus, RunId, RunStatus};

pub type SubmissionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum Subject {
    Submission(SubmissionId),
    Run(RunId),
    All,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Started,
    StreamingResult,
    Completed,
    Error,
    Dropped,
    ProgressChanged,
    StatusChanged,
    Judged,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::Started,
        EventKind::StreamingResult,
        EventKind::Completed,
        EventKind::Error,
        EventKind::Dropped,
        EventKind::ProgressChanged,
        EventKind::StatusChanged,
        EventKind::Judged,
    ];
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Generation {
    pub run_id: RunId,
    pub model: String,
    pub task_id: String,
    pub response: String,
    pub elapsed_ms: u64,
    pub tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Failure {
    pub run_id: RunId,
    pub model: Option<String>,
    pub task_id: Option<String>,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    RunStarted {
        run_id: RunId,
        models: Vec<String>,
        judge_model: String,
        total_results: usize,
    },
    Chunk {
        run_id: RunId,
        model: String,
        task_id: String,
        text: String,
    },
    Generation(Generation),
    Failure(Failure),
    Dropped {
        run_id: RunId,
        model: String,
        task_id: String,
    },
    Progress(Progress),
    Status {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
    },
    Judged {
        run_id: RunId,
        model: String,
        task_id: String,
        status: ResultStatus,
        score: Option<f64>,
    },
}

impl EventPayload {
    pub fn run_id(&self) -> RunId {
        match self {
            EventPayload::RunStarted { run_id, .. }
            | EventPayload::Chunk { run_id, .. }
            | EventPayload::Dropped { run_id, .. }
            | EventPayload::Status { run_id, .. }
            | EventPayload::Judged { run_id, .. } => *run_id,
            EventPayload::Generation(g) => g.run_id,
            EventPayload::Failure(f) => f.run_id,
            EventPayload::Progress(p) => p.run_id,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutedEvent {
    /// Dispatch position, stamped by the consumer. Callbacks always see
    /// strictly increasing values.
    pub seq: u64,
    pub subject: Subject,
    pub kind: EventKind,
    pub emitted_at: DateTime<Utc>,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token(u64);

pub type Callback = Arc<dyn Fn(&RoutedEvent) + Send + Sync>;

struct Registration {
    token: Token,
    callback: Callback,
}

#[derive(Default)]
struct Registry {
    by_key: HashMap<(Subject, EventKind), Vec<Registration>>,
    keys: HashMap<Token, (Subject, EventKind)>,
}

impl Registry {
    fn matching(&self, event: &RoutedEvent) -> Vec<Callback> {
        let mut subjects = vec![event.subject];
        if let Subject::Submission(_) = event.subject {
            subjects.push(Subject::Run(event.payload.run_id()));
        }
        if event.subject != Subject::All {
            subjects.push(Subject::All);
        }

        subjects
            .into_iter()
            .filter_map(|s| self.by_key.get(&(s, event.kind)))
            .flatten()
            .map(|r| r.callback.clone())
            .collect()
    }
}

enum Envelope {
    Event(RoutedEvent),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

struct Shared {
    registry: Mutex<Registry>,
    next_token: AtomicU64,
}

#[derive(Clone)]
pub struct EventRouter {
    tx: mpsc::UnboundedSender<Envelope>,
    shared: Arc<Shared>,
}

pub struct RouterConsumer {
    rx: mpsc::UnboundedReceiver<Envelope>,
    shared: Arc<Shared>,
    next_seq: u64,
}

impl EventRouter {
    pub fn new() -> (Self, RouterConsumer) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::default()),
            next_token: AtomicU64::new(1),
        });
        (
            Self {
                tx,
                shared: shared.clone(),
            },
            RouterConsumer {
                rx,
                shared,
                next_seq: 1,
            },
        )
    }

    /// Creates a router and spawns its consumer on the current runtime.
    pub fn spawn() -> Self {
        let (router, consumer) = Self::new();
        tokio::spawn(consumer.run());
        router
    }

    pub fn register<F>(&self, subject: Subject, kind: EventKind, callback: F) -> Token
    where
        F: Fn(&RoutedEvent) + Send + Sync + 'static,
    {
        let token = Token(self.shared.next_token.fetch_add(1, Ordering::Relaxed));
        let mut registry = self.shared.registry.lock();
        registry
            .by_key
            .entry((subject, kind))
            .or_default()
            .push(Registration {
                token,
                callback: Arc::new(callback),
            });
        registry.keys.insert(token, (subject, kind));
        token
    }

    /// Removing an unknown or already removed token is a no-op.
    pub fn unregister(&self, token: Token) {
        let mut registry = self.shared.registry.lock();
        let Some(key) = registry.keys.remove(&token) else {
            return;
        };
        if let Some(list) = registry.by_key.get_mut(&key) {
            list.retain(|r| r.token != token);
            if list.is_empty() {
                registry.by_key.remove(&key);
            }
        }
    }

    pub fn registrations(&self) -> usize {
        self.shared.registry.lock().keys.len()
    }

    pub fn emit(&self, subject: Subject, kind: EventKind, payload: EventPayload) {
        let event = RoutedEvent {
            seq: 0,
            subject,
            kind,
            emitted_at: Utc::now(),
            payload,
        };
        if self.tx.send(Envelope::Event(event)).is_err() {
            debug!(?subject, ?kind, "Event router consumer gone, event discarded");
        }
    }

    /// Resolves once every event enqueued before this call has been dispatched.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(Envelope::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(Envelope::Shutdown);
    }
}

impl RouterConsumer {
    pub async fn run(mut self) {
        while let Some(envelope) = self.rx.recv().await {
            match envelope {
                Envelope::Event(mut event) => {
                    event.seq = self.next_seq;
                    self.next_seq += 1;
                    self.dispatch(&event);
                }
                Envelope::Flush(done) => {
                    let _ = done.send(());
                }
                Envelope::Shutdown => break,
            }
        }
        debug!("Event router consumer stopped");
    }

    fn dispatch(&self, event: &RoutedEvent) {
        // Callbacks run outside the lock so they may register, unregister or emit.
        let callbacks = self.shared.registry.lock().matching(event);
        for callback in callbacks {
            if catch_unwind(AssertUnwindSafe(|| callback(event))).is_err() {
                error!(seq = event.seq, kind = ?event.kind, "Event callback panicked");
            }
        }
    }
}
