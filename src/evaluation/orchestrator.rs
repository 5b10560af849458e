use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::pipeline::{JudgeOutcome, JudgingCoordinator};
use super::progress::{ProgressAggregator, StatusTransition};
use crate::backend::InferenceBackend;
use crate::dataset::TaskSource;
use crate::error::{BenchError, Result};
use crate::metrics::Metrics;
use crate::report::{ReportArtifact, ReportFormat, Reporter};
use crate::router::{
    EventKind, EventPayload, EventRouter, Failure, Generation, RoutedEvent, Subject, Token,
};
use crate::scheduler::Scheduler;
use crate::store::ResultStore;
use crate::types::{
    BenchResult, Progress, ResultKey, ResultStatus, Run, RunConfig, RunId, RunStatus, Task,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Halt {
    Pause,
    Stop,
}

impl Halt {
    pub fn status(self) -> RunStatus {
        match self {
            Halt::Pause => RunStatus::Paused,
            Halt::Stop => RunStatus::Stopped,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub tasks_path: PathBuf,
    pub max_concurrent: usize,
    pub generation_timeout: Duration,
    pub health_timeout: Duration,
    pub judge_timeout: Duration,
    pub judge_attempts: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            tasks_path: PathBuf::from("tasks"),
            max_concurrent: 2,
            generation_timeout: Duration::from_secs(600),
            health_timeout: Duration::from_secs(30),
            judge_timeout: Duration::from_secs(300),
            judge_attempts: 2,
        }
    }
}

pub struct Collaborators {
    pub backend: Arc<dyn InferenceBackend>,
    pub store: Arc<dyn ResultStore>,
    pub tasks: Arc<dyn TaskSource>,
    pub reporter: Arc<dyn Reporter>,
}

/// Shared state between the public handle, the run driver and the router
/// callbacks of one active run.
struct RunControl {
    run_id: RunId,
    halt: Mutex<Option<Halt>>,
    fatal: Mutex<Option<BenchError>>,
    outstanding: watch::Sender<usize>,
    finished: watch::Sender<Option<RunStatus>>,
    tokens: Mutex<Vec<Token>>,
}

impl RunControl {
    fn new(run_id: RunId) -> Arc<Self> {
        Arc::new(Self {
            run_id,
            halt: Mutex::new(None),
            fatal: Mutex::new(None),
            outstanding: watch::channel(0).0,
            finished: watch::channel(None).0,
            tokens: Mutex::new(Vec::new()),
        })
    }

    /// A stop request overrides an earlier pause.
    fn request_halt(&self, halt: Halt) {
        let mut current = self.halt.lock();
        if *current != Some(Halt::Stop) {
            *current = Some(halt);
        }
    }

    fn halt(&self) -> Option<Halt> {
        *self.halt.lock()
    }

    fn set_fatal(&self, err: BenchError) {
        self.fatal.lock().get_or_insert(err);
    }

    fn fatal(&self) -> Option<BenchError> {
        self.fatal.lock().clone()
    }

    fn submitted(&self) {
        self.outstanding.send_modify(|n| *n += 1);
    }

    fn settled(&self) {
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }

    async fn drained(&self) {
        let mut rx = self.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    async fn finished(&self) -> RunStatus {
        let mut rx = self.finished.subscribe();
        let status = match rx.wait_for(|s| s.is_some()).await {
            Ok(status) => *status,
            Err(_) => None,
        };
        status.unwrap_or(RunStatus::Failed)
    }
}

struct Inner {
    backend: Arc<dyn InferenceBackend>,
    store: Arc<dyn ResultStore>,
    tasks: Arc<dyn TaskSource>,
    reporter: Arc<dyn Reporter>,
    router: EventRouter,
    scheduler: Scheduler,
    judge: JudgingCoordinator,
    progress: ProgressAggregator,
    metrics: Arc<Metrics>,
    tasks_path: PathBuf,
    active: Mutex<Option<Arc<RunControl>>>,
    last_run: Mutex<Option<RunId>>,
}

/// Owns the run lifecycle: seeding, the generation phase, the judging phase
/// and every run status transition.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl Orchestrator {
    pub fn new(
        collaborators: Collaborators,
        settings: Settings,
        router: EventRouter,
        metrics: Arc<Metrics>,
    ) -> Self {
        let Collaborators {
            backend,
            store,
            tasks,
            reporter,
        } = collaborators;

        let scheduler = Scheduler::new(backend.clone(), router.clone(), metrics.clone())
            .with_concurrency(settings.max_concurrent)
            .with_timeout(settings.generation_timeout)
            .with_health_timeout(settings.health_timeout);
        let judge = JudgingCoordinator::new(backend.clone())
            .with_timeout(settings.judge_timeout)
            .with_health_timeout(settings.health_timeout)
            .with_max_attempts(settings.judge_attempts);
        let progress = ProgressAggregator::new(store.clone());

        Self {
            inner: Arc::new(Inner {
                backend,
                store,
                tasks,
                reporter,
                router,
                scheduler,
                judge,
                progress,
                metrics,
                tasks_path: settings.tasks_path,
                active: Mutex::new(None),
                last_run: Mutex::new(None),
            }),
        }
    }

    pub fn start(&self, config: RunConfig) -> Result<RunId> {
        config.validate()?;
        let inner = &self.inner;

        let mut active = inner.active.lock();
        if let Some(current) = active.as_ref() {
            return Err(BenchError::InvalidState(format!(
                "run {} is still active",
                current.run_id
            )));
        }

        let tasks = inner.tasks.load_tasks(&inner.tasks_path)?;
        if tasks.is_empty() {
            return Err(BenchError::Config(format!(
                "no tasks found in {}",
                inner.tasks_path.display()
            )));
        }

        let run = inner.store.create_run(&config.models, &config.judge_model)?;
        let seeded = inner
            .seed(&run, &tasks)
            .and_then(|total| inner.transition(run.id, RunStatus::Running).map(|_| total));
        let total = match seeded {
            Ok(total) => total,
            Err(e) => {
                error!(run_id = run.id, error = %e, "Failed to seed run");
                let _ = inner.transition(run.id, RunStatus::Failed);
                return Err(e);
            }
        };

        inner.metrics.run_started();
        inner.router.emit(
            Subject::Run(run.id),
            EventKind::Started,
            EventPayload::RunStarted {
                run_id: run.id,
                models: config.models.clone(),
                judge_model: config.judge_model.clone(),
                total_results: total,
            },
        );
        info!(
            run_id = run.id,
            models = ?config.models,
            judge = %config.judge_model,
            tasks = tasks.len(),
            total_results = total,
            "Run started"
        );

        let control = RunControl::new(run.id);
        *active = Some(control.clone());
        *inner.last_run.lock() = Some(run.id);
        drop(active);

        tokio::spawn(inner.clone().drive(control));
        Ok(run.id)
    }

    pub fn resume(&self, run_id: RunId) -> Result<()> {
        let inner = &self.inner;
        let mut active = inner.active.lock();
        if let Some(current) = active.as_ref() {
            return Err(BenchError::InvalidState(format!(
                "run {} is still active",
                current.run_id
            )));
        }

        let run = inner.store.get_run(run_id)?;
        if !run.status.is_resumable() {
            return Err(BenchError::InvalidState(format!(
                "run {} is {} and cannot be resumed",
                run_id, run.status
            )));
        }
        inner.transition(run_id, RunStatus::Running)?;
        info!(run_id, from = %run.status, "Run resumed");

        let control = RunControl::new(run_id);
        *active = Some(control.clone());
        *inner.last_run.lock() = Some(run_id);
        drop(active);

        tokio::spawn(inner.clone().drive(control));
        Ok(())
    }

    /// Asks the active run to halt at the next job boundary and drops its
    /// queued submissions. Returns without waiting for in-flight jobs.
    pub fn request_halt(&self, halt: Halt) -> Result<RunId> {
        Ok(self.halt_control(halt)?.run_id)
    }

    pub async fn pause(&self) -> Result<RunStatus> {
        let control = self.halt_control(Halt::Pause)?;
        Ok(control.finished().await)
    }

    pub async fn stop(&self) -> Result<RunStatus> {
        let control = self.halt_control(Halt::Stop)?;
        Ok(control.finished().await)
    }

    fn halt_control(&self, halt: Halt) -> Result<Arc<RunControl>> {
        let inner = &self.inner;
        let control = inner
            .active
            .lock()
            .clone()
            .ok_or_else(|| BenchError::InvalidState("no run is active".into()))?;

        let run = inner.store.get_run(control.run_id)?;
        if !run.status.is_active() {
            return Err(BenchError::InvalidState(format!(
                "run {} is {} and cannot be halted",
                run.id, run.status
            )));
        }

        control.request_halt(halt);
        inner.scheduler.cancel_pending(control.run_id);
        info!(run_id = control.run_id, halt = ?halt, "Halt requested");
        Ok(control)
    }

    /// Progress of the active run, or of the most recently started one.
    /// After a restart this falls back to the newest run in the store.
    pub fn get_progress(&self) -> Result<Progress> {
        let last = *self.inner.last_run.lock();
        let run_id = match last {
            Some(id) => id,
            None => self
                .inner
                .store
                .list_runs()?
                .iter()
                .map(|run| run.id)
                .max()
                .ok_or_else(|| BenchError::InvalidState("no run has been started".into()))?,
        };
        self.progress(run_id)
    }

    pub fn progress(&self, run_id: RunId) -> Result<Progress> {
        self.inner.store.get_run(run_id)?;
        self.inner.progress.progress(run_id)
    }

    pub fn transitions(&self, run_id: RunId) -> Vec<StatusTransition> {
        self.inner.progress.transitions(run_id)
    }

    pub fn active_run(&self) -> Option<RunId> {
        self.inner.active.lock().as_ref().map(|c| c.run_id)
    }

    pub fn run(&self, run_id: RunId) -> Result<Run> {
        self.inner.store.get_run(run_id)
    }

    pub fn list_runs(&self) -> Result<Vec<Run>> {
        self.inner.store.list_runs()
    }

    pub fn results(&self, run_id: RunId) -> Result<Vec<BenchResult>> {
        self.inner.store.get_run(run_id)?;
        self.inner.store.load_results(run_id, None)
    }

    pub fn delete_run(&self, run_id: RunId) -> Result<()> {
        if self.active_run() == Some(run_id) {
            return Err(BenchError::InvalidState(format!(
                "run {} is active and cannot be deleted",
                run_id
            )));
        }
        self.inner.store.delete_run(run_id)?;
        self.inner.progress.forget(run_id);
        info!(run_id, "Run deleted");
        Ok(())
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        self.inner.backend.list_models().await
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    pub fn subscribe<F>(&self, kind: EventKind, callback: F) -> Token
    where
        F: Fn(&RoutedEvent) + Send + Sync + 'static,
    {
        self.inner.router.register(Subject::All, kind, callback)
    }

    pub fn subscribe_run<F>(&self, run_id: RunId, kind: EventKind, callback: F) -> Token
    where
        F: Fn(&RoutedEvent) + Send + Sync + 'static,
    {
        self.inner.router.register(Subject::Run(run_id), kind, callback)
    }

    pub fn unsubscribe(&self, token: Token) {
        self.inner.router.unregister(token);
    }

    pub fn generate_report(&self, run_id: RunId, format: ReportFormat) -> Result<ReportArtifact> {
        let run = self.inner.store.get_run(run_id)?;
        let counts = self.inner.store.status_counts(run_id)?;
        let settled = counts.awaiting_execution == 0 && counts.awaiting_judgement == 0;
        if !run.status.is_terminal() && !settled {
            return Err(BenchError::InvalidState(format!(
                "run {} is {} with {} results still pending",
                run_id,
                run.status,
                counts.awaiting_execution + counts.awaiting_judgement
            )));
        }
        self.inner.reporter.generate(run_id, format)
    }

    /// Marks runs left RUNNING or JUDGING by a previous process as STOPPED so
    /// they can be resumed. Runs that never finished seeding are marked FAILED.
    pub fn recover_interrupted_runs(&self) -> Result<Vec<RunId>> {
        let active = self.active_run();
        let mut recovered = Vec::new();
        for run in self.inner.store.list_runs()? {
            if Some(run.id) == active {
                continue;
            }
            let target = match run.status {
                RunStatus::Running | RunStatus::Judging => RunStatus::Stopped,
                RunStatus::New => RunStatus::Failed,
                _ => continue,
            };
            self.inner.transition(run.id, target)?;
            warn!(run_id = run.id, from = %run.status, to = %target, "Recovered interrupted run");
            recovered.push(run.id);
        }
        Ok(recovered)
    }

    /// Waits for the active run driver to settle, then for every event it
    /// emitted to be dispatched.
    pub async fn wait_for_idle(&self) {
        let control = self.inner.active.lock().clone();
        if let Some(control) = control {
            control.finished().await;
        }
        self.inner.router.flush().await;
    }
}

impl Inner {
    fn seed(&self, run: &Run, tasks: &[Task]) -> Result<usize> {
        self.store.save_tasks(run.id, tasks)?;
        let pending: Vec<BenchResult> = run
            .models
            .iter()
            .flat_map(|model| {
                tasks
                    .iter()
                    .map(move |task| BenchResult::pending(run.id, model.clone(), task.id.clone()))
            })
            .collect();
        Ok(self.store.save_results(pending)?.len())
    }

    fn transition(&self, run_id: RunId, to: RunStatus) -> Result<Run> {
        let before = self.store.get_run(run_id)?;
        let after = self.store.update_run_status(run_id, to)?;
        self.progress.record_transition(run_id, before.status, to);
        self.router.emit(
            Subject::Run(run_id),
            EventKind::StatusChanged,
            EventPayload::Status {
                run_id,
                from: before.status,
                to,
            },
        );
        info!(run_id, from = %before.status, to = %to, "Run status changed");
        Ok(after)
    }

    fn emit_progress(&self, run_id: RunId) {
        match self.progress.progress(run_id) {
            Ok(p) => self.router.emit(
                Subject::Run(run_id),
                EventKind::ProgressChanged,
                EventPayload::Progress(p),
            ),
            Err(e) => warn!(run_id, error = %e, "Failed to compute progress"),
        }
    }

    fn emit_run_error(&self, run_id: RunId, err: &BenchError) {
        self.router.emit(
            Subject::Run(run_id),
            EventKind::Error,
            EventPayload::Failure(Failure {
                run_id,
                model: None,
                task_id: None,
                code: err.code().to_string(),
                message: err.to_string(),
            }),
        );
    }

    async fn drive(self: Arc<Self>, control: Arc<RunControl>) {
        let run_id = control.run_id;
        self.register_callbacks(&control);

        let outcome = match self.execute_phase(&control).await {
            Ok(None) => self.judge_phase(&control).await,
            other => other,
        };
        let target = match outcome {
            Ok(Some(halt)) => halt.status(),
            Ok(None) => RunStatus::Completed,
            Err(e) => {
                error!(run_id, error = %e, "Run aborted");
                self.emit_run_error(run_id, &e);
                RunStatus::Failed
            }
        };

        let settled = match self.transition(run_id, target) {
            Ok(_) => target,
            Err(e) => {
                error!(run_id, to = %target, error = %e, "Failed to record final run status");
                if target != RunStatus::Failed {
                    let _ = self.transition(run_id, RunStatus::Failed);
                }
                RunStatus::Failed
            }
        };
        if settled.is_terminal() {
            self.metrics.run_finished(settled == RunStatus::Completed);
        }

        for token in control.tokens.lock().drain(..) {
            self.router.unregister(token);
        }
        {
            let mut active = self.active.lock();
            if active.as_ref().is_some_and(|c| Arc::ptr_eq(c, &control)) {
                *active = None;
            }
        }
        self.emit_progress(run_id);
        info!(run_id, status = %settled, "Run driver finished");
        control.finished.send_replace(Some(settled));
    }

    /// Run-level callbacks must exist before the first submission so no
    /// terminal event can be missed.
    fn register_callbacks(self: &Arc<Self>, control: &Arc<RunControl>) {
        let mut tokens = control.tokens.lock();
        for kind in [EventKind::Completed, EventKind::Error, EventKind::Dropped] {
            let inner = self.clone();
            let ctl = control.clone();
            tokens.push(self.router.register(
                Subject::Run(control.run_id),
                kind,
                move |event| inner.on_terminal(&ctl, event),
            ));
        }
    }

    fn on_terminal(&self, control: &RunControl, event: &RoutedEvent) {
        // Run-level ERROR events come from the orchestrator itself.
        if !matches!(event.subject, Subject::Submission(_)) {
            return;
        }
        let run_id = control.run_id;

        let outcome = match &event.payload {
            EventPayload::Generation(g) => self.record_generation(g),
            EventPayload::Failure(f) => self.record_generation_failure(f),
            EventPayload::Dropped { model, task_id, .. } => {
                debug!(run_id, model = %model, task_id = %task_id, "Submission dropped");
                Ok(false)
            }
            _ => Ok(false),
        };

        match outcome {
            Ok(true) => self.emit_progress(run_id),
            Ok(false) => {}
            Err(e) if e.is_fatal() => {
                error!(run_id, error = %e, "Failed to persist generation outcome");
                control.set_fatal(e);
                self.scheduler.cancel_pending(run_id);
            }
            Err(e) => warn!(run_id, error = %e, "Ignored generation outcome"),
        }
        control.settled();
    }

    fn record_generation(&self, g: &Generation) -> Result<bool> {
        let mut result = self
            .store
            .get_result(&ResultKey::new(g.run_id, g.model.clone(), g.task_id.clone()))?;
        if result.status != ResultStatus::AwaitingExecution {
            warn!(result_id = result.id, status = %result.status, "Duplicate generation outcome");
            return Ok(false);
        }
        result.record_generation(g.response.clone(), g.elapsed_ms, g.tokens)?;
        self.store.update_result(&result)?;
        self.metrics.generation_finished(true, g.elapsed_ms);
        Ok(true)
    }

    fn record_generation_failure(&self, f: &Failure) -> Result<bool> {
        let (Some(model), Some(task_id)) = (&f.model, &f.task_id) else {
            return Ok(false);
        };
        let mut result = self
            .store
            .get_result(&ResultKey::new(f.run_id, model.clone(), task_id.clone()))?;
        if result.status != ResultStatus::AwaitingExecution {
            return Ok(false);
        }
        result.record_failure(f.message.clone(), None)?;
        self.store.update_result(&result)?;
        self.metrics.generation_finished(false, 0);
        Ok(true)
    }

    fn run_tasks(&self, run_id: RunId) -> Result<HashMap<String, Arc<Task>>> {
        Ok(self
            .store
            .load_tasks(run_id)?
            .into_iter()
            .map(|t| (t.id.clone(), Arc::new(t)))
            .collect())
    }

    /// Generation phase. Returns `Some(halt)` when a pause or stop cut it short.
    async fn execute_phase(&self, control: &RunControl) -> Result<Option<Halt>> {
        let run_id = control.run_id;
        let tasks = self.run_tasks(run_id)?;

        loop {
            if let Some(halt) = control.halt() {
                return Ok(Some(halt));
            }
            let pending = self
                .store
                .load_results(run_id, Some(ResultStatus::AwaitingExecution))?;
            if pending.is_empty() {
                return Ok(None);
            }
            info!(run_id, pending = pending.len(), "Dispatching generation jobs");

            for result in pending {
                if control.halt().is_some() || control.fatal().is_some() {
                    break;
                }
                match tasks.get(&result.task_id) {
                    Some(task) => {
                        control.submitted();
                        self.scheduler.submit(run_id, task.clone(), &result.model);
                    }
                    None => {
                        let mut result = result;
                        let message = format!("task {} is missing from the run dataset", result.task_id);
                        if let Err(e) = result
                            .record_failure(message, None)
                            .and_then(|_| self.store.update_result(&result))
                        {
                            control.set_fatal(e);
                        }
                    }
                }
            }
            if control.halt().is_some() {
                // A halt may have raced with the last submissions.
                self.scheduler.cancel_pending(run_id);
            }

            control.drained().await;
            if let Some(e) = control.fatal() {
                return Err(e);
            }
        }
    }

    /// Judging phase, strictly sequential. Halts take effect between results.
    async fn judge_phase(&self, control: &RunControl) -> Result<Option<Halt>> {
        let run_id = control.run_id;
        if let Some(halt) = control.halt() {
            return Ok(Some(halt));
        }

        let run = self.transition(run_id, RunStatus::Judging)?;
        if !self.judge.judge_available(&run.judge_model).await {
            let e = BenchError::BackendUnavailable(format!(
                "judge model {} is not reachable",
                run.judge_model
            ));
            warn!(run_id, judge = %run.judge_model, "Judge unavailable, stopping run");
            self.emit_run_error(run_id, &e);
            return Ok(Some(Halt::Stop));
        }

        let tasks = self.run_tasks(run_id)?;
        let queue = self
            .store
            .load_results(run_id, Some(ResultStatus::AwaitingJudgement))?;
        info!(run_id, pending = queue.len(), judge = %run.judge_model, "Judging results");

        for queued in queue {
            if let Some(halt) = control.halt() {
                return Ok(Some(halt));
            }
            let mut result = self.store.get_result(&queued.key())?;
            let outcome = match tasks.get(&result.task_id) {
                Some(task) => self.judge.judge(&run.judge_model, task, &result).await,
                None => JudgeOutcome::Failed {
                    error: BenchError::Dataset(format!(
                        "task {} is missing from the run dataset",
                        result.task_id
                    )),
                    raw_output: None,
                },
            };
            if !outcome.apply(&mut result)? {
                continue;
            }
            self.store.update_result(&result)?;
            self.metrics
                .judgement_finished(matches!(outcome, JudgeOutcome::Scored(_)));

            self.router.emit(
                Subject::Run(run_id),
                EventKind::Judged,
                EventPayload::Judged {
                    run_id,
                    model: result.model.clone(),
                    task_id: result.task_id.clone(),
                    status: result.status,
                    score: result.score,
                },
            );
            self.emit_progress(run_id);
        }
        Ok(None)
    }
}
