//! Task domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifier the control plane assigns to a task
pub type TaskId = i64;

/// Unit of work fetched from the control plane
///
/// Owned by exactly one in-flight dispatch and dropped when it returns.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,

    /// Opaque workflow definition handed to the execution engine
    #[serde(default)]
    pub workflow_payload: String,

    /// Workflow context (repository, event, credential token, ...)
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,

    #[serde(default)]
    pub secrets: HashMap<String, String>,
}

impl Task {
    /// Returns a string field of the context, or "" when absent or not a string
    pub fn context_str(&self, key: &str) -> &str {
        self.context
            .get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
    }
}

/// Result of a job or of one of its steps
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskResult {
    #[default]
    #[serde(rename = "RESULT_UNSPECIFIED")]
    Unspecified,
    #[serde(rename = "RESULT_SUCCESS")]
    Success,
    #[serde(rename = "RESULT_FAILURE")]
    Failure,
    #[serde(rename = "RESULT_SKIPPED")]
    Skipped,
    #[serde(rename = "RESULT_CANCELLED")]
    Cancelled,
}

impl TaskResult {
    /// Parses the lowercase result names emitted by the workflow engine
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(TaskResult::Success),
            "failure" => Some(TaskResult::Failure),
            "skipped" => Some(TaskResult::Skipped),
            "cancelled" => Some(TaskResult::Cancelled),
            _ => None,
        }
    }

    pub fn is_unspecified(&self) -> bool {
        *self == TaskResult::Unspecified
    }
}

impl std::fmt::Display for TaskResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskResult::Unspecified => write!(f, "unspecified"),
            TaskResult::Success => write!(f, "success"),
            TaskResult::Failure => write!(f, "failure"),
            TaskResult::Skipped => write!(f, "skipped"),
            TaskResult::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Mutable execution status of a running task
///
/// Reports always carry a full snapshot of this structure, never a diff.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskState {
    pub id: TaskId,
    #[serde(default)]
    pub result: TaskResult,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub steps: Vec<StepState>,
}

impl TaskState {
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

/// Status of one workflow step
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepState {
    pub id: i64,
    #[serde(default)]
    pub result: TaskResult,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stopped_at: Option<DateTime<Utc>>,
    /// Absolute index of the first log row belonging to this step
    #[serde(default)]
    pub log_index: i64,
    #[serde(default)]
    pub log_length: i64,
}

impl StepState {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_engine_results() {
        assert_eq!(TaskResult::parse("success"), Some(TaskResult::Success));
        assert_eq!(TaskResult::parse("cancelled"), Some(TaskResult::Cancelled));
        assert_eq!(TaskResult::parse("Success"), None);
        assert_eq!(TaskResult::parse(""), None);
    }

    #[test]
    fn test_result_wire_names() {
        let json = serde_json::to_string(&TaskResult::Failure).unwrap();
        assert_eq!(json, "\"RESULT_FAILURE\"");

        let state: TaskState = serde_json::from_str(r#"{"id": 7, "result": "RESULT_CANCELLED"}"#).unwrap();
        assert_eq!(state.id, 7);
        assert_eq!(state.result, TaskResult::Cancelled);
        assert!(state.steps.is_empty());
    }

    #[test]
    fn test_context_str() {
        let task: Task = serde_json::from_str(
            r#"{"id": 1, "context": {"token": "abc", "run_number": 3}}"#,
        )
        .unwrap();

        assert_eq!(task.context_str("token"), "abc");
        assert_eq!(task.context_str("run_number"), "");
        assert_eq!(task.context_str("missing"), "");
    }
}
