//! Workflow engine adapter
//!
//! The runner does not interpret workflows itself. It hands the payload to
//! an external engine and turns the engine's output into [`LogEvent`]s.

use anyhow::{Context, Result};
use async_trait::async_trait;
use relay_core::domain::log::LogEvent;
use relay_core::domain::task::TaskId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::reporter::LogSink;

/// Everything the engine needs to run one job
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineJob {
    pub task_id: TaskId,
    pub payload: String,
    pub env: HashMap<String, String>,
    pub secrets: HashMap<String, String>,
    pub context: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
pub trait WorkflowEngine: Send + Sync {
    /// Number of steps of the single job in `payload`
    async fn plan(&self, payload: &str) -> Result<usize>;

    /// Runs the job, streaming events into `sink` until it finishes or
    /// `cancel` fires
    async fn execute(
        &self,
        job: EngineJob,
        sink: Arc<dyn LogSink>,
        cancel: CancellationToken,
    ) -> Result<()>;
}

/// Engine driven through an external executable
///
/// `<program> <args..> plan` reads the workflow payload on stdin and prints
/// the step count. `<program> <args..> run` reads an [`EngineJob`] as JSON on
/// stdin and writes one event per stdout line, either a JSON [`LogEvent`] or
/// plain text.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    program: String,
    args: Vec<String>,
}

impl ProcessEngine {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Splits a command line on whitespace
    pub fn from_command_line(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts.next().context("engine command is empty")?;
        Ok(Self::new(program, parts))
    }

    fn command(&self, subcommand: &str) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(subcommand)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }
}

#[async_trait]
impl WorkflowEngine for ProcessEngine {
    async fn plan(&self, payload: &str) -> Result<usize> {
        let mut child = self
            .command("plan")
            .spawn()
            .with_context(|| format!("Failed to start engine {}", self.program))?;

        let mut stdin = child.stdin.take().context("engine stdin unavailable")?;
        let input = payload.as_bytes().to_vec();
        let writer = tokio::spawn(async move { stdin.write_all(&input).await });

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for engine")?;
        if let Err(e) = writer.await? {
            tracing::debug!("Engine closed stdin early: {}", e);
        }

        if !output.status.success() {
            anyhow::bail!(
                "engine plan failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .trim()
            .parse::<usize>()
            .with_context(|| format!("engine printed an invalid step count: {:?}", stdout.trim()))
    }

    async fn execute(
        &self,
        job: EngineJob,
        sink: Arc<dyn LogSink>,
        cancel: CancellationToken,
    ) -> Result<()> {
        let task_id = job.task_id;
        let mut child = self
            .command("run")
            .spawn()
            .with_context(|| format!("Failed to start engine {}", self.program))?;

        let mut stdin = child.stdin.take().context("engine stdin unavailable")?;
        let input = serde_json::to_vec(&job)?;
        let writer = tokio::spawn(async move {
            stdin.write_all(&input).await?;
            stdin.shutdown().await
        });

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(task_id, "engine: {}", line);
                }
            });
        }

        let stdout = child.stdout.take().context("engine stdout unavailable")?;
        let mut lines = BufReader::new(stdout).lines();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!(task_id, "Stopping engine");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(task_id, "Failed to kill engine: {}", e);
                    }
                    anyhow::bail!("job cancelled");
                }
                line = lines.next_line() => match line.context("Failed to read engine output")? {
                    Some(line) => sink.fire(parse_event(&line)),
                    None => break,
                },
            }
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(task_id, "Failed to kill engine: {}", e);
                }
                anyhow::bail!("job cancelled");
            }
            status = child.wait() => status.context("Failed to wait for engine")?,
        };

        if let Err(e) = writer.await? {
            tracing::debug!(task_id, "Engine closed stdin early: {}", e);
        }

        if !status.success() {
            anyhow::bail!("engine exited with {}", status);
        }
        Ok(())
    }
}

/// Parses one line of engine output
fn parse_event(line: &str) -> LogEvent {
    if line.trim_start().starts_with('{') {
        if let Ok(event) = serde_json::from_str::<LogEvent>(line) {
            return event;
        }
    }
    LogEvent::message(line)
}
