use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

use crate::error::{BenchError, Result};
use crate::types::{
    BenchResult, ResultId, ResultKey, ResultStatus, Run, RunId, RunStatus, Task,
};

/// Tables shared by the in-memory and JSON-backed stores.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub(super) struct StoreState {
    next_run_id: RunId,
    next_result_id: ResultId,
    runs: BTreeMap<RunId, Run>,
    tasks: BTreeMap<RunId, Vec<Task>>,
    results: BTreeMap<ResultId, BenchResult>,
    #[serde(skip)]
    index: HashMap<ResultKey, ResultId>,
}

impl StoreState {
    pub fn rebuild_index(&mut self) {
        self.index = self
            .results
            .values()
            .map(|r| (r.key(), r.id))
            .collect();
    }

    pub fn create_run(&mut self, models: &[String], judge_model: &str) -> Run {
        self.next_run_id += 1;
        let now = Utc::now();
        let run = Run {
            id: self.next_run_id,
            models: models.to_vec(),
            judge_model: judge_model.to_string(),
            status: RunStatus::New,
            created_at: now,
            updated_at: now,
        };
        self.runs.insert(run.id, run.clone());
        run
    }

    pub fn get_run(&self, run_id: RunId) -> Result<Run> {
        self.runs
            .get(&run_id)
            .cloned()
            .ok_or_else(|| BenchError::NotFound(format!("run {}", run_id)))
    }

    pub fn list_runs(&self) -> Vec<Run> {
        self.runs.values().cloned().collect()
    }

    pub fn update_run_status(&mut self, run_id: RunId, status: RunStatus) -> Result<Run> {
        let run = self
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| BenchError::NotFound(format!("run {}", run_id)))?;
        if !run.status.can_transition_to(status) {
            return Err(BenchError::InvalidState(format!(
                "run {} cannot move from {} to {}",
                run_id, run.status, status
            )));
        }
        run.status = status;
        run.updated_at = Utc::now();
        Ok(run.clone())
    }

    pub fn delete_run(&mut self, run_id: RunId) -> Result<()> {
        if self.runs.remove(&run_id).is_none() {
            return Err(BenchError::NotFound(format!("run {}", run_id)));
        }
        self.tasks.remove(&run_id);
        self.results.retain(|_, r| r.run_id != run_id);
        self.index.retain(|k, _| k.run_id != run_id);
        Ok(())
    }

    pub fn save_tasks(&mut self, run_id: RunId, tasks: &[Task]) -> Result<()> {
        self.get_run(run_id)?;
        self.tasks.insert(run_id, tasks.to_vec());
        Ok(())
    }

    pub fn load_tasks(&self, run_id: RunId) -> Result<Vec<Task>> {
        self.get_run(run_id)?;
        Ok(self.tasks.get(&run_id).cloned().unwrap_or_default())
    }

    pub fn save_results(&mut self, results: Vec<BenchResult>) -> Result<Vec<BenchResult>> {
        for result in &results {
            self.get_run(result.run_id)?;
            if self.index.contains_key(&result.key()) {
                return Err(BenchError::InvalidState(format!(
                    "result for model {} and task {} already exists in run {}",
                    result.model, result.task_id, result.run_id
                )));
            }
        }

        let mut saved = Vec::with_capacity(results.len());
        for mut result in results {
            self.next_result_id += 1;
            result.id = self.next_result_id;
            self.index.insert(result.key(), result.id);
            self.results.insert(result.id, result.clone());
            saved.push(result);
        }
        Ok(saved)
    }

    pub fn load_results(&self, run_id: RunId, status: Option<ResultStatus>) -> Vec<BenchResult> {
        self.results
            .values()
            .filter(|r| r.run_id == run_id)
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect()
    }

    pub fn get_result(&self, key: &ResultKey) -> Result<BenchResult> {
        self.index
            .get(key)
            .and_then(|id| self.results.get(id))
            .cloned()
            .ok_or_else(|| {
                BenchError::NotFound(format!(
                    "result for model {} and task {} in run {}",
                    key.model, key.task_id, key.run_id
                ))
            })
    }

    pub fn update_result(&mut self, result: &BenchResult) -> Result<()> {
        let stored = self
            .results
            .get_mut(&result.id)
            .ok_or_else(|| BenchError::NotFound(format!("result {}", result.id)))?;
        if stored.key() != result.key() {
            return Err(BenchError::InvalidState(format!(
                "result {} identity does not match the stored record",
                result.id
            )));
        }
        if !stored.status.can_advance_to(result.status) {
            return Err(BenchError::InvalidState(format!(
                "result {} cannot move from {} to {}",
                result.id, stored.status, result.status
            )));
        }
        *stored = result.clone();
        Ok(())
    }
}
