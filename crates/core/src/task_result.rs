//! Progress reports pulled from a running executor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Task status as reported by the executor itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskOutcome {
    Preparing,
    Running,
    Done,
    Failed,
    Canceled,
}

impl TaskOutcome {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskOutcome::Done | TaskOutcome::Failed | TaskOutcome::Canceled)
    }
}

/// One report returned by `GET {endpoint}/tasks/{id}/result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub status: TaskOutcome,
    #[serde(default)]
    pub progress_percentage: f64,
    #[serde(default)]
    pub result_json: Option<String>,
    /// Log metadata (log path, host, ...) persisted as job attributes on completion.
    #[serde(default)]
    pub log_attributes: BTreeMap<String, String>,
}

impl TaskResult {
    pub fn running(progress_percentage: f64) -> Self {
        Self {
            status: TaskOutcome::Running,
            progress_percentage,
            result_json: None,
            log_attributes: BTreeMap::new(),
        }
    }

    pub fn finished(status: TaskOutcome, result_json: Option<String>) -> Self {
        Self {
            status,
            progress_percentage: 100.0,
            result_json,
            log_attributes: BTreeMap::new(),
        }
    }

    pub fn with_log_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.log_attributes.insert(key.into(), value.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
