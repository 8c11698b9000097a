//! Log domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Stage name the workflow engine uses for events emitted while steps run
pub const MAIN_STAGE: &str = "Main";

/// One timestamped line of task output, as delivered to the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRow {
    pub time: DateTime<Utc>,
    pub content: String,
}

impl LogRow {
    pub fn now(content: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            content: content.into(),
        }
    }
}

/// Structured log event pushed by the workflow engine
///
/// Besides the text line, an event may attribute itself to a step and may
/// declare a step or job result.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    #[serde(default = "Utc::now")]
    pub time: DateTime<Utc>,

    #[serde(default)]
    pub message: String,

    /// Engine phase; `"Main"` while steps are executing
    #[serde(default)]
    pub stage: Option<String>,

    #[serde(default)]
    pub step_number: Option<usize>,

    /// Whether the line is raw step output (as opposed to engine chatter)
    #[serde(default)]
    pub raw_output: bool,

    #[serde(default)]
    pub job_result: Option<String>,

    #[serde(default)]
    pub step_result: Option<String>,

    /// Job outputs produced so far
    #[serde(default)]
    pub outputs: HashMap<String, String>,
}

impl LogEvent {
    /// Plain message outside of any step
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            message: message.into(),
            stage: None,
            step_number: None,
            raw_output: false,
            job_result: None,
            step_result: None,
            outputs: HashMap::new(),
        }
    }

    /// Raw output line of the given step
    pub fn step_output(step: usize, message: impl Into<String>) -> Self {
        Self {
            stage: Some(MAIN_STAGE.to_string()),
            step_number: Some(step),
            raw_output: true,
            ..Self::message(message)
        }
    }

    /// Step completion event
    pub fn step_finished(step: usize, result: &str) -> Self {
        Self {
            stage: Some(MAIN_STAGE.to_string()),
            step_number: Some(step),
            step_result: Some(result.to_string()),
            ..Self::message("")
        }
    }

    /// Job completion event, emitted by the engine after all steps
    pub fn job_finished(result: &str) -> Self {
        Self {
            stage: Some("Post".to_string()),
            job_result: Some(result.to_string()),
            ..Self::message("")
        }
    }

    pub fn is_main_stage(&self) -> bool {
        self.stage.as_deref() == Some(MAIN_STAGE)
    }
}
