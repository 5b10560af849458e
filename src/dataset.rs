use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{BenchError, Result};
use crate::types::{Rubric, Task};

pub trait TaskSource: Send + Sync {
    fn load_tasks(&self, path: &Path) -> Result<Vec<Task>>;
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TaskIdRepr {
    Text(String),
    Number(i64),
}

impl TaskIdRepr {
    fn into_string(self) -> String {
        match self {
            TaskIdRepr::Text(s) => s,
            TaskIdRepr::Number(n) => n.to_string(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct ExpectedAnswer {
    #[serde(default)]
    most_expected: String,
    #[serde(default)]
    good_answer: String,
    #[serde(default)]
    pass_option: String,
}

#[derive(Debug, Deserialize)]
struct TaskDocument {
    task_id: TaskIdRepr,
    category: String,
    sub_category: String,
    question: String,
    #[serde(default)]
    expected_answer: ExpectedAnswer,
    incorrect_direction: String,
}

impl From<TaskDocument> for Task {
    fn from(doc: TaskDocument) -> Self {
        Task {
            id: doc.task_id.into_string(),
            category: doc.category,
            sub_category: doc.sub_category,
            prompt: doc.question,
            rubric: Rubric {
                most_expected: doc.expected_answer.most_expected,
                acceptable: doc.expected_answer.good_answer,
                minimal_pass: doc.expected_answer.pass_option,
            },
            incorrect_direction: doc.incorrect_direction,
        }
    }
}

/// Loads tasks from a YAML file or a directory of `.yaml`/`.yml` files.
///
/// A file may hold one task document or a list of them. Entries missing a
/// required field are skipped with a warning, as are files that are not valid
/// YAML. Duplicate task ids across the whole dataset are rejected.
#[derive(Debug, Default, Clone)]
pub struct YamlTaskSource;

impl YamlTaskSource {
    pub fn new() -> Self {
        Self
    }

    fn files(path: &Path) -> Result<Vec<PathBuf>> {
        if path.is_file() {
            return Ok(vec![path.to_path_buf()]);
        }
        let entries = std::fs::read_dir(path).map_err(|e| {
            BenchError::Dataset(format!("cannot read task directory {}: {}", path.display(), e))
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_yaml(p))
            .collect();
        files.sort();
        Ok(files)
    }

    fn parse_file(path: &Path) -> Vec<Task> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Failed to read task file");
                return Vec::new();
            }
        };
        let value: serde_yaml::Value = match serde_yaml::from_str(&content) {
            Ok(v) => v,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "Failed to parse YAML task file");
                return Vec::new();
            }
        };

        let documents = match value {
            serde_yaml::Value::Null => {
                debug!(file = %path.display(), "Task file is empty, skipping");
                return Vec::new();
            }
            serde_yaml::Value::Sequence(items) => items,
            other => vec![other],
        };

        documents
            .into_iter()
            .enumerate()
            .filter_map(|(index, doc)| match serde_yaml::from_value::<TaskDocument>(doc) {
                Ok(doc) => Some(Task::from(doc)),
                Err(e) => {
                    warn!(file = %path.display(), index, error = %e, "Skipping invalid task entry");
                    None
                }
            })
            .collect()
    }
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    )
}

impl TaskSource for YamlTaskSource {
    fn load_tasks(&self, path: &Path) -> Result<Vec<Task>> {
        let files = Self::files(path)?;
        let mut tasks = Vec::new();
        let mut seen = HashSet::new();

        for file in &files {
            for task in Self::parse_file(file) {
                if !seen.insert(task.id.clone()) {
                    return Err(BenchError::Dataset(format!(
                        "duplicate task id {} in {}",
                        task.id,
                        file.display()
                    )));
                }
                tasks.push(task);
            }
        }

        info!(
            tasks = tasks.len(),
            files = files.len(),
            path = %path.display(),
            "Loaded benchmark tasks"
        );
        Ok(tasks)
    }
}
