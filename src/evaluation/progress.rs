use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::error::Result;
use crate::store::ResultStore;
use crate::types::{Progress, RunId, RunStatus, StatusCounts};

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct StatusTransition {
    pub from: RunStatus,
    pub to: RunStatus,
    pub elapsed_ms: u64,
}

pub fn progress_from_counts(run_id: RunId, counts: &StatusCounts) -> Progress {
    let total = counts.total();
    let completed = total - counts.awaiting_execution;
    let percent = if total == 0 {
        0.0
    } else {
        (completed as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
    };
    Progress {
        run_id,
        total,
        completed,
        judged: counts.judgement_completed,
        failed: counts.failed,
        percent,
    }
}

struct Timeline {
    last_transition: Instant,
    transitions: Vec<StatusTransition>,
}

/// Derives run completion from persisted result counts and keeps a
/// per-run record of status transitions for diagnostics.
pub struct ProgressAggregator {
    store: Arc<dyn ResultStore>,
    timelines: Mutex<HashMap<RunId, Timeline>>,
}

impl ProgressAggregator {
    pub fn new(store: Arc<dyn ResultStore>) -> Self {
        Self {
            store,
            timelines: Mutex::new(HashMap::new()),
        }
    }

    pub fn progress(&self, run_id: RunId) -> Result<Progress> {
        let counts = self.store.status_counts(run_id)?;
        Ok(progress_from_counts(run_id, &counts))
    }

    pub fn record_transition(&self, run_id: RunId, from: RunStatus, to: RunStatus) {
        let now = Instant::now();
        let mut timelines = self.timelines.lock();
        let timeline = timelines.entry(run_id).or_insert_with(|| Timeline {
            last_transition: now,
            transitions: Vec::new(),
        });
        let elapsed_ms = now.duration_since(timeline.last_transition).as_millis() as u64;
        debug!(run_id, from = %from, to = %to, elapsed_ms, "Run status transition");
        timeline.transitions.push(StatusTransition {
            from,
            to,
            elapsed_ms,
        });
        timeline.last_transition = now;
    }

    pub fn transitions(&self, run_id: RunId) -> Vec<StatusTransition> {
        self.timelines
            .lock()
            .get(&run_id)
            .map(|t| t.transitions.clone())
            .unwrap_or_default()
    }

    pub fn forget(&self, run_id: RunId) {
        self.timelines.lock().remove(&run_id);
    }
}
