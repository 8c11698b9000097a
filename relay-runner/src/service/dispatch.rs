//! Task dispatch
//!
//! Runs one task end to end: duplicate protection, reporter lifecycle and
//! the hand-off to the workflow engine.

use anyhow::{Context, Result};
use async_trait::async_trait;
use relay_client::ControlPlane;
use relay_core::domain::task::{Task, TaskId};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::engine::{EngineJob, WorkflowEngine};
use super::reporter::{LogSink, Reporter};
use crate::scheduler::Dispatch;

/// Environment variable pointing jobs at the artifact cache
pub const CACHE_URL_ENV: &str = "ACTIONS_CACHE_URL";

pub struct TaskRunner {
    name: String,
    version: String,
    client: Arc<dyn ControlPlane>,
    engine: Arc<dyn WorkflowEngine>,
    envs: HashMap<String, String>,
    report_interval: Duration,
    running: Mutex<HashSet<TaskId>>,
}

impl TaskRunner {
    pub fn new(
        name: impl Into<String>,
        client: Arc<dyn ControlPlane>,
        engine: Arc<dyn WorkflowEngine>,
        envs: HashMap<String, String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            client,
            engine,
            envs,
            report_interval: Duration::from_secs(1),
            running: Mutex::new(HashSet::new()),
        }
    }

    /// Exposes the artifact cache to jobs
    pub fn with_cache_url(mut self, external_url: &str) -> Self {
        self.envs
            .insert(CACHE_URL_ENV.to_string(), format!("{}/", external_url));
        self
    }

    pub fn with_report_interval(mut self, interval: Duration) -> Self {
        self.report_interval = interval;
        self
    }

    fn running(&self) -> MutexGuard<'_, HashSet<TaskId>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self, id: TaskId) -> bool {
        self.running().contains(&id)
    }

    /// Runs `task`, always leaving a terminal state on the control plane
    pub async fn run(&self, task: Task, cancel: CancellationToken) -> Result<()> {
        if !self.running().insert(task.id) {
            anyhow::bail!("task {} is already running", task.id);
        }
        let _running = RunningGuard {
            runner: self,
            id: task.id,
        };

        let reporter = Arc::new(
            Reporter::new(&task, Arc::clone(&self.client), cancel.clone())
                .with_interval(self.report_interval),
        );
        let _daemon = reporter.run_daemon();

        let result = self.execute(&task, &reporter, cancel).await;

        let last_words = match &result {
            Ok(()) => String::new(),
            Err(e) => format!("{:#}", e),
        };
        if let Err(e) = reporter.close(&last_words).await {
            warn!(task_id = task.id, "Failed to deliver final report: {}", e);
        }

        result
    }

    async fn execute(
        &self,
        task: &Task,
        reporter: &Arc<Reporter>,
        cancel: CancellationToken,
    ) -> Result<()> {
        reporter.log(format!(
            "{}(version:{}) received task {} of job {}, be triggered by event: {}",
            self.name,
            self.version,
            task.id,
            task.context_str("job"),
            task.context_str("event_name"),
        ));

        let steps = self
            .engine
            .plan(&task.workflow_payload)
            .await
            .context("Failed to plan workflow")?;
        reporter.reset_steps(steps);

        info!(
            task_id = task.id,
            "Task repo is {} ({} steps)",
            task.context_str("repository"),
            steps
        );

        let job = EngineJob {
            task_id: task.id,
            payload: task.workflow_payload.clone(),
            env: self.envs.clone(),
            secrets: task.secrets.clone(),
            context: task.context.clone(),
        };

        reporter.log("workflow prepared");

        let sink: Arc<dyn LogSink> = reporter.clone();
        self.engine.execute(job, sink, cancel).await
    }
}

#[async_trait]
impl Dispatch for TaskRunner {
    async fn dispatch(&self, task: Task, cancel: CancellationToken) -> Result<()> {
        self.run(task, cancel).await
    }
}

/// Removes a task id from the running set when dropped
struct RunningGuard<'a> {
    runner: &'a TaskRunner,
    id: TaskId,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.runner.running().remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeControlPlane, task};
    use relay_core::domain::log::LogEvent;
    use relay_core::domain::task::TaskResult;
    use tokio::sync::Notify;

    /// Engine with a fixed two-step plan
    #[derive(Default)]
    struct StubEngine {
        fail: bool,
        /// When set, execution blocks until notified or cancelled
        gate: Option<Arc<Notify>>,
        seen_env: Mutex<Option<HashMap<String, String>>>,
    }

    #[async_trait]
    impl WorkflowEngine for StubEngine {
        async fn plan(&self, _payload: &str) -> Result<usize> {
            Ok(2)
        }

        async fn execute(
            &self,
            job: EngineJob,
            sink: Arc<dyn LogSink>,
            cancel: CancellationToken,
        ) -> Result<()> {
            *self.seen_env.lock().unwrap() = Some(job.env);

            if let Some(gate) = &self.gate {
                tokio::select! {
                    _ = gate.notified() => {}
                    _ = cancel.cancelled() => anyhow::bail!("job cancelled"),
                }
            }
            if self.fail {
                anyhow::bail!("container exited with code 2");
            }

            for step in 0..2 {
                sink.fire(LogEvent::step_output(step, format!("step {}", step)));
                sink.fire(LogEvent::step_finished(step, "success"));
            }
            sink.fire(LogEvent::job_finished("success"));
            Ok(())
        }
    }

    fn greeting_task() -> Task {
        let mut t = task(11);
        t.context.insert("job".into(), serde_json::json!("build"));
        t.context.insert("event_name".into(), serde_json::json!("push"));
        t
    }

    #[tokio::test]
    async fn test_successful_run_reports_success() {
        let client = Arc::new(FakeControlPlane::new());
        let engine = Arc::new(StubEngine::default());
        let runner = TaskRunner::new("builder", client.clone(), engine.clone(), HashMap::new())
            .with_cache_url("http://10.0.0.5:4000");

        runner
            .run(greeting_task(), CancellationToken::new())
            .await
            .unwrap();

        let (state, _) = client.last_state().unwrap();
        assert_eq!(state.result, TaskResult::Success);
        assert!(state.steps.iter().all(|s| s.result == TaskResult::Success));

        let logs = client.stored_contents();
        assert_eq!(
            logs[0],
            format!(
                "builder(version:{}) received task 11 of job build, be triggered by event: push",
                env!("CARGO_PKG_VERSION")
            )
        );
        assert_eq!(logs[1], "workflow prepared");
        assert!(logs.contains(&"step 1".to_string()));

        let env = engine.seen_env.lock().unwrap().clone().unwrap();
        assert_eq!(
            env.get(CACHE_URL_ENV).map(String::as_str),
            Some("http://10.0.0.5:4000/")
        );
        assert!(!runner.is_running(11));
    }

    #[tokio::test]
    async fn test_engine_failure_becomes_last_words() {
        let client = Arc::new(FakeControlPlane::new());
        let engine = Arc::new(StubEngine {
            fail: true,
            ..Default::default()
        });
        let runner = TaskRunner::new("builder", client.clone(), engine, HashMap::new());

        assert!(runner.run(task(3), CancellationToken::new()).await.is_err());

        let (state, _) = client.last_state().unwrap();
        assert_eq!(state.result, TaskResult::Failure);
        assert!(state.steps.iter().all(|s| s.result == TaskResult::Cancelled));
        assert_eq!(
            client.stored_contents().last().map(String::as_str),
            Some("container exited with code 2")
        );
    }

    #[tokio::test]
    async fn test_duplicate_task_is_rejected() {
        let client = Arc::new(FakeControlPlane::new());
        let gate = Arc::new(Notify::new());
        let engine = Arc::new(StubEngine {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let runner = Arc::new(TaskRunner::new("builder", client, engine, HashMap::new()));

        let first = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run(task(5), CancellationToken::new()).await })
        };
        while !runner.is_running(5) {
            tokio::task::yield_now().await;
        }

        let err = runner
            .run(task(5), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "task 5 is already running");
        assert!(runner.is_running(5));

        gate.notify_one();
        first.await.unwrap().unwrap();
        assert!(!runner.is_running(5));
    }

    #[tokio::test]
    async fn test_cancellation_stops_engine() {
        let client = Arc::new(FakeControlPlane::new());
        let engine = Arc::new(StubEngine {
            gate: Some(Arc::new(Notify::new())),
            ..Default::default()
        });
        let runner = TaskRunner::new("builder", client.clone(), engine, HashMap::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(runner.run(task(8), cancel).await.is_err());

        let (state, _) = client.last_state().unwrap();
        assert_eq!(state.result, TaskResult::Failure);
        assert_eq!(
            client.stored_contents().last().map(String::as_str),
            Some("job cancelled")
        );
    }
}
