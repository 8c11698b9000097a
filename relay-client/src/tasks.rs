//! Task-related runner-service calls

use crate::HttpControlPlane;
use crate::error::Result;
use relay_core::domain::log::LogRow;
use relay_core::domain::task::{Task, TaskId, TaskState};
use relay_core::dto::runner::{
    FetchTaskRequest, FetchTaskResponse, UpdateLogRequest, UpdateLogResponse, UpdateTaskRequest,
    UpdateTaskResponse,
};
use std::collections::HashMap;

impl HttpControlPlane {
    // =============================================================================
    // Task Acquisition
    // =============================================================================

    /// Request a task for execution
    ///
    /// # Arguments
    /// * `task_version` - Last task-stream version seen by this runner
    ///
    /// # Returns
    /// The task, if the server handed one out, and the current stream version
    pub async fn fetch_task(&self, task_version: i64) -> Result<(Option<Task>, i64)> {
        let response: FetchTaskResponse = self
            .call("FetchTask", &FetchTaskRequest { task_version })
            .await?;

        // A zero id is how an empty task comes back from some servers
        let task = response.task.filter(|t| t.id != 0);
        Ok((task, response.task_version))
    }

    // =============================================================================
    // Progress Reporting
    // =============================================================================

    /// Send log rows for a task
    ///
    /// # Arguments
    /// * `task_id` - The task the rows belong to
    /// * `offset` - Absolute index of the first row
    /// * `rows` - Rows not yet acknowledged
    /// * `no_more` - Whether this is the final submission
    ///
    /// # Returns
    /// The acknowledgement index
    pub async fn update_log(
        &self,
        task_id: TaskId,
        offset: i64,
        rows: Vec<LogRow>,
        no_more: bool,
    ) -> Result<i64> {
        let response: UpdateLogResponse = self
            .call(
                "UpdateLog",
                &UpdateLogRequest {
                    task_id,
                    index: offset,
                    rows,
                    no_more,
                },
            )
            .await?;

        Ok(response.ack_index)
    }

    /// Send a task state snapshot along with outputs not yet accepted
    pub async fn update_task(
        &self,
        state: TaskState,
        outputs: HashMap<String, String>,
    ) -> Result<UpdateTaskResponse> {
        self.call("UpdateTask", &UpdateTaskRequest { state, outputs })
            .await
    }
}
