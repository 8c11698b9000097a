//! In-process control plane used by unit tests

use async_trait::async_trait;
use relay_client::{ClientError, ControlPlane, Result};
use relay_core::domain::log::LogRow;
use relay_core::domain::runner::RunnerIdentity;
use relay_core::domain::task::{Task, TaskId, TaskResult, TaskState};
use relay_core::dto::runner::UpdateTaskResponse;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

#[derive(Debug, Clone)]
pub struct LogCall {
    pub offset: i64,
    pub rows: Vec<LogRow>,
    pub no_more: bool,
}

/// Accepts everything by default; individual behaviors are scripted per test
#[derive(Default)]
pub struct FakeControlPlane {
    pub tasks: Mutex<VecDeque<Task>>,
    pub task_version: Mutex<i64>,
    pub seen_versions: Mutex<Vec<i64>>,
    pub fetches: AtomicUsize,
    pub fail_fetch: AtomicBool,

    /// Rows durably stored, indexed by absolute position
    pub stored_rows: Mutex<Vec<LogRow>>,
    pub log_calls: Mutex<Vec<LogCall>>,
    /// Acks returned instead of the stored length, consumed in order
    pub scripted_acks: Mutex<VecDeque<i64>>,
    /// Number of upcoming log calls that fail
    pub failing_log_calls: AtomicUsize,

    pub state_calls: Mutex<Vec<(TaskState, HashMap<String, String>)>>,
    pub cancel_task: AtomicBool,

    /// Log and state calls never answer while set
    pub stall_reports: AtomicBool,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let fake = Self::new();
        fake.tasks.lock().unwrap().extend(tasks);
        fake
    }

    pub fn stored_contents(&self) -> Vec<String> {
        self.stored_rows
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.content.clone())
            .collect()
    }

    pub fn last_state(&self) -> Option<(TaskState, HashMap<String, String>)> {
        self.state_calls.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn fetch_task(&self, task_version: i64) -> Result<(Option<Task>, i64)> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.seen_versions.lock().unwrap().push(task_version);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(ClientError::api_error(503, "unavailable"));
        }
        let task = self.tasks.lock().unwrap().pop_front();
        Ok((task, *self.task_version.lock().unwrap()))
    }

    async fn update_log(
        &self,
        _task_id: TaskId,
        offset: i64,
        rows: Vec<LogRow>,
        no_more: bool,
    ) -> Result<i64> {
        self.log_calls.lock().unwrap().push(LogCall {
            offset,
            rows: rows.clone(),
            no_more,
        });
        if self.stall_reports.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }

        if self
            .failing_log_calls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ClientError::api_error(502, "bad gateway"));
        }

        let mut stored = self.stored_rows.lock().unwrap();
        stored.truncate(offset as usize);
        stored.extend(rows);

        match self.scripted_acks.lock().unwrap().pop_front() {
            Some(ack) => Ok(ack),
            None => Ok(stored.len() as i64),
        }
    }

    async fn update_task(
        &self,
        state: TaskState,
        outputs: HashMap<String, String>,
    ) -> Result<UpdateTaskResponse> {
        if self.stall_reports.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let sent_outputs = outputs.keys().cloned().collect();
        let mut authoritative = state.clone();
        if self.cancel_task.load(Ordering::SeqCst) {
            authoritative.result = TaskResult::Cancelled;
        }
        self.state_calls.lock().unwrap().push((state, outputs));

        Ok(UpdateTaskResponse {
            state: Some(authoritative),
            sent_outputs,
        })
    }

    async fn register(&self, name: &str, token: &str, _labels: &[String]) -> Result<RunnerIdentity> {
        Ok(RunnerIdentity {
            id: 7,
            uuid: "8d7f0c1e-0000-4000-8000-000000000007".to_string(),
            name: name.to_string(),
            token: format!("runner-token-for-{}", token),
        })
    }
}

pub fn task(id: TaskId) -> Task {
    Task {
        id,
        ..Default::default()
    }
}
