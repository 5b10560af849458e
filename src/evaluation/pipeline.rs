use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::evaluator::{Evaluator, Verdict};
use crate::backend::InferenceBackend;
use crate::error::BenchError;
use crate::types::{BenchResult, ResultStatus, Task};

const DEFAULT_JUDGE_TIMEOUT_SECS: u64 = 300;
const DEFAULT_HEALTH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_ATTEMPTS: u32 = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum JudgeOutcome {
    Scored(Verdict),
    /// The result was already judged; nothing was sent to the backend.
    AlreadyJudged,
    Failed {
        error: BenchError,
        raw_output: Option<String>,
    },
}

impl JudgeOutcome {
    /// Applies the outcome to `result`. Returns `false` for `AlreadyJudged`.
    pub fn apply(&self, result: &mut BenchResult) -> crate::error::Result<bool> {
        match self {
            JudgeOutcome::Scored(v) => result.record_judgement(v.score, v.rationale.clone())?,
            JudgeOutcome::Failed { error, raw_output } => {
                result.record_failure(error.to_string(), raw_output.clone())?
            }
            JudgeOutcome::AlreadyJudged => return Ok(false),
        }
        Ok(true)
    }
}

/// Second-phase pipeline: scores one completed generation at a time with the
/// run's judge model.
pub struct JudgingCoordinator {
    backend: Arc<dyn InferenceBackend>,
    timeout: Duration,
    health_timeout: Duration,
    max_attempts: u32,
}

impl JudgingCoordinator {
    pub fn new(backend: Arc<dyn InferenceBackend>) -> Self {
        Self {
            backend,
            timeout: Duration::from_secs(DEFAULT_JUDGE_TIMEOUT_SECS),
            health_timeout: Duration::from_secs(DEFAULT_HEALTH_TIMEOUT_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub async fn judge_available(&self, judge_model: &str) -> bool {
        tokio::time::timeout(self.health_timeout, self.backend.health_check(judge_model))
            .await
            .unwrap_or(false)
    }

    pub async fn judge(&self, judge_model: &str, task: &Task, result: &BenchResult) -> JudgeOutcome {
        if result.status == ResultStatus::JudgementCompleted {
            debug!(result_id = result.id, "Result already judged, skipping");
            return JudgeOutcome::AlreadyJudged;
        }

        let response = result.response.as_deref().unwrap_or_default();
        let prompt = Evaluator::build_prompt(task, response);
        let start = Instant::now();
        let mut last_raw = None;
        let mut last_error = None;

        for attempt in 1..=self.max_attempts {
            let call = self
                .backend
                .generate(judge_model, &prompt.user, Some(&prompt.system));
            let raw = match tokio::time::timeout(self.timeout, call).await {
                Ok(Ok(raw)) => raw,
                Ok(Err(e)) => {
                    warn!(result_id = result.id, judge = %judge_model, error = %e, "Judge call failed");
                    return JudgeOutcome::Failed {
                        error: e,
                        raw_output: None,
                    };
                }
                Err(_) => {
                    warn!(result_id = result.id, judge = %judge_model, "Judge call timed out");
                    return JudgeOutcome::Failed {
                        error: BenchError::Timeout(self.timeout.as_secs()),
                        raw_output: None,
                    };
                }
            };

            match Evaluator::parse_verdict(&raw) {
                Ok(verdict) => {
                    info!(
                        result_id = result.id,
                        model = %result.model,
                        task_id = %result.task_id,
                        score = verdict.score,
                        attempt,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "Result judged"
                    );
                    return JudgeOutcome::Scored(verdict);
                }
                Err(e) => {
                    warn!(
                        result_id = result.id,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Unparseable judge output"
                    );
                    last_error = Some(e);
                    last_raw = Some(raw);
                }
            }
        }

        JudgeOutcome::Failed {
            error: last_error
                .unwrap_or_else(|| BenchError::JudgeParse("no judge attempt was made".into())),
            raw_output: last_raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{self, MockBackend};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn generated() -> BenchResult {
        let mut r = BenchResult::pending(1, "model-a", "t1");
        r.id = 10;
        r.record_generation("forty two".into(), 100, 3).unwrap();
        r
    }

    #[tokio::test]
    async fn test_scored_verdict() {
        let backend = Arc::new(MockBackend::new());
        let coordinator = JudgingCoordinator::new(backend.clone());
        let outcome = coordinator.judge("judge", &testkit::task("t1"), &generated()).await;

        let JudgeOutcome::Scored(v) = &outcome else {
            panic!("expected a score, got {:?}", outcome);
        };
        assert_eq!(v.score, 0.9);
        assert_eq!(backend.judge_calls(), 1);

        let mut r = generated();
        assert!(outcome.apply(&mut r).unwrap());
        assert_eq!(r.status, ResultStatus::JudgementCompleted);
        assert_eq!(r.score, Some(0.9));
    }

    #[tokio::test]
    async fn test_already_judged_is_a_no_op() {
        let backend = Arc::new(MockBackend::new());
        let coordinator = JudgingCoordinator::new(backend.clone());
        let mut r = generated();
        r.record_judgement(0.5, "fine".into()).unwrap();
        let before = r.clone();

        let outcome = coordinator.judge("judge", &testkit::task("t1"), &r).await;
        assert_eq!(outcome, JudgeOutcome::AlreadyJudged);
        assert!(!outcome.apply(&mut r).unwrap());
        assert_eq!(r, before);
        assert_eq!(backend.judge_calls(), 0);
    }

    #[tokio::test]
    async fn test_unparseable_output_retried_once_then_failed() {
        let backend = Arc::new(MockBackend::new().with_judge(|_| "no idea".to_string()));
        let coordinator = JudgingCoordinator::new(backend.clone());
        let outcome = coordinator.judge("judge", &testkit::task("t1"), &generated()).await;

        let JudgeOutcome::Failed { error, raw_output } = &outcome else {
            panic!("expected failure, got {:?}", outcome);
        };
        assert_eq!(error.code(), "judge_parse_error");
        assert_eq!(raw_output.as_deref(), Some("no idea"));
        assert_eq!(backend.judge_calls(), 2);

        let mut r = generated();
        outcome.apply(&mut r).unwrap();
        assert_eq!(r.status, ResultStatus::Failed);
        assert!(r.error.is_some());
        assert_eq!(r.judge_output.as_deref(), Some("no idea"));
    }

    #[tokio::test]
    async fn test_retry_can_recover() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        let backend = Arc::new(MockBackend::new().with_judge(move |_| {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                "garbage".to_string()
            } else {
                testkit::GOOD_VERDICT.to_string()
            }
        }));
        let coordinator = JudgingCoordinator::new(backend.clone());
        let outcome = coordinator.judge("judge", &testkit::task("t1"), &generated()).await;
        assert!(matches!(outcome, JudgeOutcome::Scored(_)));
        assert_eq!(backend.judge_calls(), 2);
    }

    #[tokio::test]
    async fn test_single_attempt_configuration() {
        let backend = Arc::new(MockBackend::new().with_judge(|_| "garbage".to_string()));
        let coordinator = JudgingCoordinator::new(backend.clone()).with_max_attempts(1);
        let outcome = coordinator.judge("judge", &testkit::task("t1"), &generated()).await;
        assert!(matches!(outcome, JudgeOutcome::Failed { .. }));
        assert_eq!(backend.judge_calls(), 1);
    }

    #[tokio::test]
    async fn test_judge_prompt_carries_response() {
        let seen = testkit::shared(String::new());
        let sink = seen.clone();
        let backend = Arc::new(MockBackend::new().with_judge(move |prompt| {
            *sink.lock() = prompt.to_string();
            testkit::GOOD_VERDICT.to_string()
        }));
        let coordinator = JudgingCoordinator::new(backend);
        coordinator.judge("judge", &testkit::task("t1"), &generated()).await;
        assert!(seen.lock().contains("forty two"));
    }

    #[tokio::test]
    async fn test_judge_availability() {
        let backend = Arc::new(MockBackend::new().with_unavailable("judge"));
        let coordinator = JudgingCoordinator::new(backend);
        assert!(!coordinator.judge_available("judge").await);
        assert!(coordinator.judge_available("model-a").await);
    }

    #[tokio::test]
    async fn test_slow_health_check_is_bounded_by_health_timeout() {
        let backend = Arc::new(MockBackend::new().with_health_delay(Duration::from_millis(500)));
        let coordinator = JudgingCoordinator::new(backend.clone())
            .with_timeout(Duration::from_secs(60))
            .with_health_timeout(Duration::from_millis(50));

        let started = Instant::now();
        assert!(!coordinator.judge_available("judge").await);
        assert!(started.elapsed() < Duration::from_millis(400));

        let patient = JudgingCoordinator::new(backend)
            .with_timeout(Duration::from_millis(50))
            .with_health_timeout(Duration::from_secs(5));
        assert!(patient.judge_available("judge").await);
    }
}
