use parking_lot::RwLock;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::state::StoreState;
use super::ResultStore;
use crate::error::{BenchError, Result};
use crate::types::{BenchResult, ResultKey, ResultStatus, Run, RunId, RunStatus, Task};

/// A store that keeps every table in memory and rewrites a JSON snapshot
/// after each mutation. Snapshots are written to a temp file in the same
/// directory and renamed into place, so a crash never leaves a torn file.
pub struct JsonStore {
    path: PathBuf,
    state: RwLock<StoreState>,
}

impl JsonStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                BenchError::Persistence(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let mut state = if path.exists() {
            let bytes = std::fs::read(&path).map_err(|e| {
                BenchError::Persistence(format!("cannot read {}: {}", path.display(), e))
            })?;
            serde_json::from_slice::<StoreState>(&bytes).map_err(|e| {
                BenchError::Persistence(format!("corrupt store {}: {}", path.display(), e))
            })?
        } else {
            StoreState::default()
        };
        state.rebuild_index();

        info!(path = %path.display(), "Opened JSON result store");
        Ok(Self {
            path,
            state: RwLock::new(state),
        })
    }

    fn flush(&self, state: &StoreState) -> Result<()> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| BenchError::Persistence(format!("cannot encode snapshot: {}", e)))?;

        let mut tmp = tempfile::NamedTempFile::new_in(&dir)
            .map_err(|e| BenchError::Persistence(format!("cannot create temp file: {}", e)))?;
        tmp.write_all(&bytes)
            .and_then(|_| tmp.as_file().sync_all())
            .map_err(|e| BenchError::Persistence(format!("cannot write snapshot: {}", e)))?;
        tmp.persist(&self.path).map_err(|e| {
            BenchError::Persistence(format!("cannot replace {}: {}", self.path.display(), e))
        })?;

        debug!(path = %self.path.display(), bytes = bytes.len(), "Store snapshot written");
        Ok(())
    }

    /// Applies `f` to a copy of the tables and publishes the copy only once
    /// its snapshot is on disk. A failed write leaves memory and disk equal.
    fn mutate<T>(&self, f: impl FnOnce(&mut StoreState) -> Result<T>) -> Result<T> {
        let mut state = self.state.write();
        let mut next = state.clone();
        let out = f(&mut next)?;
        self.flush(&next)?;
        *state = next;
        Ok(out)
    }
}

impl ResultStore for JsonStore {
    fn create_run(&self, models: &[String], judge_model: &str) -> Result<Run> {
        self.mutate(|s| Ok(s.create_run(models, judge_model)))
    }

    fn get_run(&self, run_id: RunId) -> Result<Run> {
        self.state.read().get_run(run_id)
    }

    fn list_runs(&self) -> Result<Vec<Run>> {
        Ok(self.state.read().list_runs())
    }

    fn update_run_status(&self, run_id: RunId, status: RunStatus) -> Result<Run> {
        self.mutate(|s| s.update_run_status(run_id, status))
    }

    fn delete_run(&self, run_id: RunId) -> Result<()> {
        self.mutate(|s| s.delete_run(run_id))
    }

    fn save_tasks(&self, run_id: RunId, tasks: &[Task]) -> Result<()> {
        self.mutate(|s| s.save_tasks(run_id, tasks))
    }

    fn load_tasks(&self, run_id: RunId) -> Result<Vec<Task>> {
        self.state.read().load_tasks(run_id)
    }

    fn save_results(&self, results: Vec<BenchResult>) -> Result<Vec<BenchResult>> {
        self.mutate(|s| s.save_results(results))
    }

    fn load_results(&self, run_id: RunId, status: Option<ResultStatus>) -> Result<Vec<BenchResult>> {
        Ok(self.state.read().load_results(run_id, status))
    }

    fn get_result(&self, key: &ResultKey) -> Result<BenchResult> {
        self.state.read().get_result(key)
    }

    fn update_result(&self, result: &BenchResult) -> Result<()> {
        self.mutate(|s| s.update_result(result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::conformance;

    fn temp_store() -> (tempfile::TempDir, JsonStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonStore::open(dir.path().join("data").join("bench.json")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_lifecycle() {
        let (_dir, store) = temp_store();
        conformance::lifecycle(&store);
    }

    #[test]
    fn test_rejects_regression() {
        let (_dir, store) = temp_store();
        conformance::rejects_regression(&store);
    }

    #[test]
    fn test_rejects_duplicate_key() {
        let (_dir, store) = temp_store();
        conformance::rejects_duplicate_key(&store);
    }

    #[test]
    fn test_delete() {
        let (_dir, store) = temp_store();
        conformance::delete(&store);
    }

    #[test]
    fn test_reopen_restores_state_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.json");

        let run_id = {
            let store = JsonStore::open(&path).unwrap();
            let run = conformance::seeded(&store);
            store.update_run_status(run.id, RunStatus::Running).unwrap();
            run.id
        };

        let store = JsonStore::open(&path).unwrap();
        assert_eq!(store.get_run(run_id).unwrap().status, RunStatus::Running);
        assert_eq!(store.load_tasks(run_id).unwrap().len(), 2);
        assert!(store.get_result(&ResultKey::new(run_id, "m2", "t1")).is_ok());

        let err = store
            .save_results(vec![BenchResult::pending(run_id, "m1", "t1")])
            .unwrap_err();
        assert_eq!(err.code(), "invalid_state");

        let next = store.create_run(&["m".to_string()], "j").unwrap();
        assert!(next.id > run_id);
    }

    #[test]
    fn test_failed_snapshot_leaves_state_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        let store = JsonStore::open(sub.join("bench.json")).unwrap();
        let run = conformance::seeded(&store);
        let key = ResultKey::new(run.id, "m1", "t1");

        std::fs::remove_dir_all(&sub).unwrap();

        let err = store
            .update_run_status(run.id, RunStatus::Running)
            .unwrap_err();
        assert_eq!(err.code(), "persistence_error");
        assert_eq!(store.get_run(run.id).unwrap().status, RunStatus::New);

        let mut result = store.get_result(&key).unwrap();
        result.record_failure("boom", None).unwrap();
        assert!(store.update_result(&result).is_err());
        assert_eq!(
            store.get_result(&key).unwrap().status,
            ResultStatus::AwaitingExecution
        );
        assert!(store.create_run(&["m".to_string()], "j").is_err());
        assert_eq!(store.list_runs().unwrap().len(), 1);

        // Once the directory is back the same change goes through.
        std::fs::create_dir_all(&sub).unwrap();
        store.update_run_status(run.id, RunStatus::Running).unwrap();
        let reopened = JsonStore::open(sub.join("bench.json")).unwrap();
        assert_eq!(reopened.get_run(run.id).unwrap().status, RunStatus::Running);
    }

    #[test]
    fn test_corrupt_file_is_a_persistence_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bench.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = JsonStore::open(&path).err().unwrap();
        assert_eq!(err.code(), "persistence_error");
    }
}
