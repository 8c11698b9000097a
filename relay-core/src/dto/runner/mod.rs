//! Control-plane DTOs
//!
//! Request and response bodies for the four runner-service operations.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::log::LogRow;
use crate::domain::runner::RunnerIdentity;
use crate::domain::task::{Task, TaskId, TaskState};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTaskRequest {
    /// Last task-stream version seen; 0 forces the server to query its store
    pub task_version: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTaskResponse {
    #[serde(default)]
    pub task: Option<Task>,
    #[serde(default)]
    pub task_version: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLogRequest {
    pub task_id: TaskId,
    /// Absolute index of the first row in `rows`
    pub index: i64,
    pub rows: Vec<LogRow>,
    pub no_more: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateLogResponse {
    /// Number of rows the server has durably stored
    pub ack_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskRequest {
    pub state: TaskState,
    #[serde(default)]
    pub outputs: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskResponse {
    /// Authoritative state as seen by the server
    #[serde(default)]
    pub state: Option<TaskState>,
    /// Output keys the server accepted
    #[serde(default)]
    pub sent_outputs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub name: String,
    pub token: String,
    #[serde(default)]
    pub agent_labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub runner: RunnerIdentity,
}
