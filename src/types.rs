use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::error::{BenchError, Result};

pub type RunId = u64;
pub type ResultId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    New,
    Running,
    Paused,
    Stopped,
    Judging,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn is_resumable(self) -> bool {
        matches!(self, RunStatus::Paused | RunStatus::Stopped)
    }

    pub fn is_active(self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Judging)
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (New, Running) => true,
            (Running, Paused | Stopped | Judging) => true,
            (Paused | Stopped, Running) => true,
            (Judging, Paused | Stopped | Completed) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::New => "NEW",
            RunStatus::Running => "RUNNING",
            RunStatus::Paused => "PAUSED",
            RunStatus::Stopped => "STOPPED",
            RunStatus::Judging => "JUDGING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: RunId,
    pub models: Vec<String>,
    pub judge_model: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    pub models: Vec<String>,
    pub judge_model: String,
}

impl RunConfig {
    pub fn new(models: Vec<String>, judge_model: impl Into<String>) -> Self {
        Self {
            models,
            judge_model: judge_model.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(BenchError::Config(
                "at least one generation model is required".into(),
            ));
        }
        let mut seen = HashSet::new();
        for model in &self.models {
            if model.trim().is_empty() {
                return Err(BenchError::Config("model names must not be blank".into()));
            }
            if !seen.insert(model.as_str()) {
                return Err(BenchError::Config(format!(
                    "model {} selected more than once",
                    model
                )));
            }
        }
        if self.judge_model.trim().is_empty() {
            return Err(BenchError::Config("a judge model is required".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Rubric {
    pub most_expected: String,
    pub acceptable: String,
    pub minimal_pass: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub category: String,
    pub sub_category: String,
    pub prompt: String,
    pub rubric: Rubric,
    pub incorrect_direction: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    AwaitingExecution,
    AwaitingJudgement,
    JudgementCompleted,
    Failed,
}

impl ResultStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ResultStatus::JudgementCompleted | ResultStatus::Failed)
    }

    /// Forward-only: a result never moves back towards AWAITING_EXECUTION.
    pub fn can_advance_to(self, next: ResultStatus) -> bool {
        use ResultStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (AwaitingExecution, AwaitingJudgement | Failed) => true,
            (AwaitingJudgement, JudgementCompleted | Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResultStatus::AwaitingExecution => "AWAITING_EXECUTION",
            ResultStatus::AwaitingJudgement => "AWAITING_JUDGEMENT",
            ResultStatus::JudgementCompleted => "JUDGEMENT_COMPLETED",
            ResultStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResultKey {
    pub run_id: RunId,
    pub model: String,
    pub task_id: String,
}

impl ResultKey {
    pub fn new(run_id: RunId, model: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            run_id,
            model: model.into(),
            task_id: task_id.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BenchResult {
    pub id: ResultId,
    pub run_id: RunId,
    pub model: String,
    pub task_id: String,
    pub status: ResultStatus,
    pub response: Option<String>,
    pub elapsed_ms: Option<u64>,
    pub tokens: Option<u64>,
    pub score: Option<f64>,
    pub rationale: Option<String>,
    pub error: Option<String>,
    pub judge_output: Option<String>,
}

impl BenchResult {
    /// A fresh AWAITING_EXECUTION result. The store assigns the id on save.
    pub fn pending(run_id: RunId, model: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            id: 0,
            run_id,
            model: model.into(),
            task_id: task_id.into(),
            status: ResultStatus::AwaitingExecution,
            response: None,
            elapsed_ms: None,
            tokens: None,
            score: None,
            rationale: None,
            error: None,
            judge_output: None,
        }
    }

    pub fn key(&self) -> ResultKey {
        ResultKey::new(self.run_id, self.model.clone(), self.task_id.clone())
    }

    fn advance(&mut self, next: ResultStatus) -> Result<()> {
        if !self.status.can_advance_to(next) {
            return Err(BenchError::InvalidState(format!(
                "result {} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }

    pub fn record_generation(&mut self, response: String, elapsed_ms: u64, tokens: u64) -> Result<()> {
        self.advance(ResultStatus::AwaitingJudgement)?;
        self.response = Some(response);
        self.elapsed_ms = Some(elapsed_ms);
        self.tokens = Some(tokens);
        self.error = None;
        Ok(())
    }

    pub fn record_judgement(&mut self, score: f64, rationale: String) -> Result<()> {
        self.advance(ResultStatus::JudgementCompleted)?;
        self.score = Some(score);
        self.rationale = Some(rationale);
        Ok(())
    }

    pub fn record_failure(&mut self, message: impl Into<String>, judge_output: Option<String>) -> Result<()> {
        self.advance(ResultStatus::Failed)?;
        self.error = Some(message.into());
        if judge_output.is_some() {
            self.judge_output = judge_output;
        }
        Ok(())
    }

    pub fn tokens_per_second(&self) -> Option<f64> {
        match (self.tokens, self.elapsed_ms) {
            (Some(tokens), Some(ms)) if ms > 0 => Some(tokens as f64 / ms as f64 * 1000.0),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub awaiting_execution: usize,
    pub awaiting_judgement: usize,
    pub judgement_completed: usize,
    pub failed: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.awaiting_execution + self.awaiting_judgement + self.judgement_completed + self.failed
    }

    pub fn add(&mut self, status: ResultStatus) {
        match status {
            ResultStatus::AwaitingExecution => self.awaiting_execution += 1,
            ResultStatus::AwaitingJudgement => self.awaiting_judgement += 1,
            ResultStatus::JudgementCompleted => self.judgement_completed += 1,
            ResultStatus::Failed => self.failed += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub run_id: RunId,
    pub total: usize,
    pub completed: usize,
    pub judged: usize,
    pub failed: usize,
    pub percent: f64,
}
