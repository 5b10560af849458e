use parking_lot::RwLock;

use super::state::StoreState;
use super::ResultStore;
use crate::error::Result;
use crate::types::{BenchResult, ResultKey, ResultStatus, Run, RunId, RunStatus, Task};

#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultStore for MemoryStore {
    fn create_run(&self, models: &[String], judge_model: &str) -> Result<Run> {
        Ok(self.state.write().create_run(models, judge_model))
    }

    fn get_run(&self, run_id: RunId) -> Result<Run> {
        self.state.read().get_run(run_id)
    }

    fn list_runs(&self) -> Result<Vec<Run>> {
        Ok(self.state.read().list_runs())
    }

    fn update_run_status(&self, run_id: RunId, status: RunStatus) -> Result<Run> {
        self.state.write().update_run_status(run_id, status)
    }

    fn delete_run(&self, run_id: RunId) -> Result<()> {
        self.state.write().delete_run(run_id)
    }

    fn save_tasks(&self, run_id: RunId, tasks: &[Task]) -> Result<()> {
        self.state.write().save_tasks(run_id, tasks)
    }

    fn load_tasks(&self, run_id: RunId) -> Result<Vec<Task>> {
        self.state.read().load_tasks(run_id)
    }

    fn save_results(&self, results: Vec<BenchResult>) -> Result<Vec<BenchResult>> {
        self.state.write().save_results(results)
    }

    fn load_results(&self, run_id: RunId, status: Option<ResultStatus>) -> Result<Vec<BenchResult>> {
        Ok(self.state.read().load_results(run_id, status))
    }

    fn get_result(&self, key: &ResultKey) -> Result<BenchResult> {
        self.state.read().get_result(key)
    }

    fn update_result(&self, result: &BenchResult) -> Result<()> {
        self.state.write().update_result(result)
    }
}
