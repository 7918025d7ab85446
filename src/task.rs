use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// A durable unit of work.
///
/// A task carries a status label that names the next step of its workflow.
/// The engine claims the task, runs the handler registered for that status,
/// and persists whatever status the handler set. A task whose status is
/// `None` is finished and is never dispatched again.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Task {
    /// Assigned by the store at insert, monotonically increasing.
    pub id: i64,
    /// Current workflow step, `None` once the task is finished.
    pub status: Option<String>,
    /// Scheduling partition; kept equal to `status` by the store on save.
    pub queue: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    /// Earliest time the task may be dispatched again.
    pub execute_after: DateTime<Utc>,
    /// Start of the current failure streak, `None` after a successful attempt.
    pub failing_since: Option<DateTime<Utc>>,
    /// True while a worker holds the task.
    pub in_progress: bool,
    /// Incremented on every save.
    pub version: i64,
}

impl Task {
    /// Move the task to the given status.
    pub fn set_status<S: Into<String>>(&mut self, status: S) {
        self.status = Some(status.into());
    }

    /// Mark the task finished.
    pub fn finish(&mut self) {
        self.status = None;
    }

    pub fn status(&self) -> Option<&str> {
        self.status.as_deref()
    }
}

#[cfg(test)]
impl Task {
    /// Bare task for unit tests that never touch the store.
    pub(crate) fn new_for_tests(id: i64, status: &str) -> Task {
        let now = Utc::now();
        Task {
            id,
            status: Some(status.to_string()),
            queue: status.to_string(),
            created: now,
            modified: now,
            execute_after: now,
            failing_since: None,
            in_progress: false,
            version: 0,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.status {
            Some(status) => write!(f, "task {} [{}]", self.id, status),
            None => write!(f, "task {} [finished]", self.id),
        }
    }
}

/// One attempt appended to the task log by the dispatcher.
#[derive(Debug, Clone)]
pub(crate) struct LogEntry {
    pub task_id: i64,
    pub status_before: Option<String>,
    pub status_after: Option<String>,
    pub exception_type: Option<String>,
    pub exception_message: Option<String>,
    pub extra_json: Option<serde_json::Value>,
}

/// A persisted attempt record, as read back from the log.
#[derive(Debug, Clone, Serialize)]
pub struct TaskLogRow {
    pub id: i64,
    pub task_id: i64,
    pub created: DateTime<Utc>,
    pub status_before: Option<String>,
    pub status_after: Option<String>,
    pub exception_type: Option<String>,
    pub exception_message: Option<String>,
    pub extra_json: Option<serde_json::Value>,
}

impl TaskLogRow {
    /// Whether this attempt recorded a failure.
    pub fn is_failure(&self) -> bool {
        self.exception_type.is_some()
    }
}
