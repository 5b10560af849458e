mod json;
mod memory;
mod state;

pub use json::JsonStore;
pub use memory::MemoryStore;

use crate::error::Result;
use crate::types::{BenchResult, ResultKey, ResultStatus, Run, RunId, RunStatus, StatusCounts, Task};

/// Persistence collaborator. Every method is safe under concurrent calls.
pub trait ResultStore: Send + Sync {
    fn create_run(&self, models: &[String], judge_model: &str) -> Result<Run>;

    fn get_run(&self, run_id: RunId) -> Result<Run>;

    fn list_runs(&self) -> Result<Vec<Run>>;

    /// Persists a status change. Illegal transitions are rejected with
    /// `InvalidState` and leave the run untouched.
    fn update_run_status(&self, run_id: RunId, status: RunStatus) -> Result<Run>;

    fn delete_run(&self, run_id: RunId) -> Result<()>;

    fn save_tasks(&self, run_id: RunId, tasks: &[Task]) -> Result<()>;

    fn load_tasks(&self, run_id: RunId) -> Result<Vec<Task>>;

    /// Inserts new results, assigning ids. A second result for an existing
    /// (run, model, task) key is rejected.
    fn save_results(&self, results: Vec<BenchResult>) -> Result<Vec<BenchResult>>;

    /// Results of a run ordered by id, optionally filtered by status.
    fn load_results(&self, run_id: RunId, status: Option<ResultStatus>) -> Result<Vec<BenchResult>>;

    fn get_result(&self, key: &ResultKey) -> Result<BenchResult>;

    /// Overwrites a stored result. Status regressions are rejected.
    fn update_result(&self, result: &BenchResult) -> Result<()>;

    fn status_counts(&self, run_id: RunId) -> Result<StatusCounts> {
        let mut counts = StatusCounts::default();
        for result in self.load_results(run_id, None)? {
            counts.add(result.status);
        }
        Ok(counts)
    }
}
