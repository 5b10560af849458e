//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::backend::{InferenceBackend, StreamStats, TokenSink};
use crate::dataset::TaskSource;
use crate::error::{BenchError, Result};
use crate::types::{Rubric, Task};

pub const GOOD_VERDICT: &str = r#"{"reason": "matches the expected answer", "grade": 0.9}"#;

type JudgeScript = Box<dyn Fn(&str) -> String + Send + Sync>;

pub struct MockBackend {
    unavailable: HashSet<String>,
    failing: HashSet<String>,
    delay: Duration,
    judge_delay: Duration,
    health_delay: Duration,
    gate_after: Option<usize>,
    gate: Semaphore,
    judge_script: JudgeScript,
    generation_calls: AtomicUsize,
    judge_calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    log: Mutex<Vec<String>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            unavailable: HashSet::new(),
            failing: HashSet::new(),
            delay: Duration::ZERO,
            judge_delay: Duration::ZERO,
            health_delay: Duration::ZERO,
            gate_after: None,
            gate: Semaphore::new(0),
            judge_script: Box::new(|_| GOOD_VERDICT.to_string()),
            generation_calls: AtomicUsize::new(0),
            judge_calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Health checks for `model` report it as unreachable.
    pub fn with_unavailable(mut self, model: &str) -> Self {
        self.unavailable.insert(model.to_string());
        self
    }

    /// Streaming for `model` fails with an inference error.
    pub fn with_failing(mut self, model: &str) -> Self {
        self.failing.insert(model.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_judge_delay(mut self, delay: Duration) -> Self {
        self.judge_delay = delay;
        self
    }

    pub fn with_health_delay(mut self, delay: Duration) -> Self {
        self.health_delay = delay;
        self
    }

    /// Generation calls numbered `n` and above (zero based) block until released.
    pub fn with_gate_after(mut self, n: usize) -> Self {
        self.gate_after = Some(n);
        self
    }

    pub fn with_judge<F>(mut self, script: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.judge_script = Box::new(script);
        self
    }

    pub fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }

    pub fn open_gate(&self) {
        self.gate.add_permits(1_000);
    }

    pub fn generation_calls(&self) -> usize {
        self.generation_calls.load(Ordering::SeqCst)
    }

    pub fn judge_calls(&self) -> usize {
        self.judge_calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().clone()
    }

    pub fn answer(model: &str, prompt: &str) -> String {
        format!("answer from {} to {}", model, prompt)
    }
}

#[async_trait]
impl InferenceBackend for MockBackend {
    async fn list_models(&self) -> Result<Vec<String>> {
        Ok(vec!["judge".into(), "model-a".into(), "model-b".into()])
    }

    async fn health_check(&self, model: &str) -> bool {
        if !self.health_delay.is_zero() {
            tokio::time::sleep(self.health_delay).await;
        }
        !self.unavailable.contains(model)
    }

    async fn stream_generate(
        &self,
        model: &str,
        prompt: &str,
        on_token: TokenSink<'_>,
    ) -> Result<StreamStats> {
        let call = self.generation_calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(format!("gen:{}:{}", model, prompt));
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);

        if self.gate_after.is_some_and(|n| call >= n) {
            if let Ok(permit) = self.gate.acquire().await {
                permit.forget();
            }
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        if self.failing.contains(model) {
            return Err(BenchError::Inference(format!("{} crashed", model)));
        }

        let mut stats = StreamStats::default();
        for word in Self::answer(model, prompt).split_inclusive(' ') {
            on_token(word);
            stats.chunks += 1;
        }
        stats.eval_count = Some(stats.chunks);
        Ok(stats)
    }

    async fn generate(&self, _model: &str, prompt: &str, _system: Option<&str>) -> Result<String> {
        self.judge_calls.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push("judge".to_string());
        if !self.judge_delay.is_zero() {
            tokio::time::sleep(self.judge_delay).await;
        }
        Ok((self.judge_script)(prompt))
    }
}

pub struct StaticTaskSource(pub Vec<Task>);

impl TaskSource for StaticTaskSource {
    fn load_tasks(&self, _path: &Path) -> Result<Vec<Task>> {
        Ok(self.0.clone())
    }
}

pub fn task(id: &str) -> Task {
    Task {
        id: id.to_string(),
        category: "general".into(),
        sub_category: "facts".into(),
        prompt: format!("question-{}", id),
        rubric: Rubric {
            most_expected: format!("best answer for {}", id),
            acceptable: "close enough".into(),
            minimal_pass: "partially right".into(),
        },
        incorrect_direction: "anything unrelated".into(),
    }
}

pub fn tasks(n: usize) -> Vec<Task> {
    (1..=n).map(|i| task(&format!("task-{}", i))).collect()
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within 5s"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn shared<T>(value: T) -> Arc<Mutex<T>> {
    Arc::new(Mutex::new(value))
}
