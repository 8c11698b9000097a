//! Task reporter
//!
//! Streams the log and state of one task to the control plane. Log rows are
//! delivered through an acknowledgement window: the server answers every
//! submission with the number of rows it has durably stored, and only rows
//! past that index are kept and resent. State is always sent as a full
//! snapshot, together with the job outputs the server has not accepted yet.
//!
//! The reporter is also the [`LogSink`] the workflow engine writes into, so
//! it derives step attribution and results from the event stream itself.

use relay_client::{ClientError, ControlPlane};
use relay_core::domain::log::{LogEvent, LogRow};
use relay_core::domain::task::{StepState, Task, TaskId, TaskResult, TaskState};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Replacement for redacted secret values
pub const MASK: &str = "***";

const CLOSE_INITIAL_DELAY: Duration = Duration::from_millis(500);
const CLOSE_MAX_DELAY: Duration = Duration::from_secs(30);
/// Budget of the last submission made after the task context is done
const FINAL_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Receives structured events from the workflow engine
pub trait LogSink: Send + Sync {
    fn fire(&self, event: LogEvent);
}

#[derive(Debug, Error)]
pub enum ReportError {
    /// The server acknowledged fewer rows than it had already confirmed
    #[error("submitted logs are lost: ack {ack} is behind offset {offset}")]
    LogsLost { ack: i64, offset: i64 },

    /// The final submission was not fully acknowledged
    #[error("not all logs are submitted: ack {ack}, expected {expected}")]
    IncompleteLogs { ack: i64, expected: i64 },

    /// The task context ended while the call was in flight
    #[error("report abandoned: task context is done")]
    Cancelled,

    /// The final submission did not finish in time
    #[error("report timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Client(#[from] ClientError),
}

/// What limits one round of control-plane calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    /// Abandoned once the task context is done
    TaskContext,
    /// Runs after the task context is done, for a fixed time
    FinalAttempt,
}

/// Masks secret values in log lines
///
/// Matching is exact and case-sensitive. At each position the longest
/// matching secret wins, so a secret that contains another is fully masked.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.is_empty())
            .collect();
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Self { secrets }
    }

    /// Secrets of a task plus its context credential
    pub fn for_task(task: &Task) -> Self {
        let token = task.context_str("token");
        Self::new(
            task.secrets
                .values()
                .map(String::as_str)
                .chain(std::iter::once(token)),
        )
    }

    pub fn redact(&self, line: &str) -> String {
        if self.secrets.is_empty() {
            return line.to_string();
        }

        let mut out = String::with_capacity(line.len());
        let mut rest = line;
        'scan: while !rest.is_empty() {
            for secret in &self.secrets {
                if let Some(after) = rest.strip_prefix(secret.as_str()) {
                    out.push_str(MASK);
                    rest = after;
                    continue 'scan;
                }
            }
            let Some(ch) = rest.chars().next() else {
                break;
            };
            out.push(ch);
            rest = &rest[ch.len_utf8()..];
        }
        out
    }
}

/// Fields guarded by the state lock
#[derive(Debug)]
struct Inner {
    /// Rows acknowledged by the server so far
    log_offset: i64,
    /// Rows not yet acknowledged; the first one has index `log_offset`
    log_rows: Vec<LogRow>,
    state: TaskState,
    outputs: HashMap<String, String>,
    sent_outputs: HashSet<String>,
}

impl Inner {
    /// Whether steps are actively reporting
    ///
    /// Engine chatter not attributed to a step is dropped in this window so it
    /// does not interleave with step output.
    fn during_steps(&self) -> bool {
        let (Some(first), Some(last)) = (self.state.steps.first(), self.state.steps.last()) else {
            return false;
        };
        if first.result.is_unspecified() && first.log_length == 0 {
            return false;
        }
        last.result.is_unspecified()
    }

    fn next_index(&self) -> i64 {
        self.log_offset + self.log_rows.len() as i64
    }
}

pub struct Reporter {
    task_id: TaskId,
    client: Arc<dyn ControlPlane>,
    cancel: CancellationToken,
    redactor: Redactor,
    interval: Duration,

    inner: Mutex<Inner>,
    /// Serializes control-plane calls
    client_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl Reporter {
    /// Creates a reporter for `task`; cancelling `cancel` stops the task
    pub fn new(task: &Task, client: Arc<dyn ControlPlane>, cancel: CancellationToken) -> Self {
        Self {
            task_id: task.id,
            client,
            cancel,
            redactor: Redactor::for_task(task),
            interval: Duration::from_secs(1),
            inner: Mutex::new(Inner {
                log_offset: 0,
                log_rows: Vec::new(),
                state: TaskState::new(task.id),
                outputs: HashMap::new(),
                sent_outputs: HashSet::new(),
            }),
            client_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Sets the period of the background flush
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the current task state
    pub fn state(&self) -> TaskState {
        self.lock().state.clone()
    }

    /// Sizes the step list of the job
    pub fn reset_steps(&self, count: usize) {
        let mut inner = self.lock();
        for id in 0..count {
            inner.state.steps.push(StepState::new(id as i64));
        }
    }

    /// Appends a runner message unless steps are reporting
    pub fn log(&self, message: impl AsRef<str>) {
        let row = LogRow::now(self.redactor.redact(message.as_ref()));
        let mut inner = self.lock();
        if !inner.during_steps() {
            inner.log_rows.push(row);
        }
    }

    /// Records job outputs; a changed value is sent again
    pub fn set_outputs(&self, outputs: HashMap<String, String>) {
        let mut inner = self.lock();
        for (key, value) in outputs {
            inner.sent_outputs.remove(&key);
            inner.outputs.insert(key, value);
        }
    }

    fn row(&self, event: &LogEvent) -> LogRow {
        let content = event.message.trim_end_matches(['\r', '\n']);
        LogRow {
            time: event.time,
            content: self.redactor.redact(content),
        }
    }

    fn apply(&self, event: &LogEvent) {
        let row = self.row(event);
        let mut inner = self.lock();
        let inner = &mut *inner;

        if inner.state.started_at.is_none() {
            inner.state.started_at = Some(event.time);
        }

        if !event.is_main_stage() {
            if let Some(result) = event.job_result.as_deref().and_then(TaskResult::parse) {
                inner.state.result = result;
                inner.state.stopped_at = Some(event.time);
                for step in &mut inner.state.steps {
                    if step.result.is_unspecified() {
                        step.result = TaskResult::Cancelled;
                    }
                }
            }
            if !inner.during_steps() {
                inner.log_rows.push(row);
            }
            return;
        }

        let Some(number) = event
            .step_number
            .filter(|n| *n < inner.state.steps.len())
        else {
            if !inner.during_steps() {
                inner.log_rows.push(row);
            }
            return;
        };

        let next_index = inner.next_index();
        let during_steps = inner.during_steps();
        let step = &mut inner.state.steps[number];
        if step.started_at.is_none() {
            step.started_at = Some(event.time);
        }

        if event.raw_output {
            if step.log_length == 0 {
                step.log_index = next_index;
            }
            step.log_length += 1;
            inner.log_rows.push(row);
        } else if !during_steps {
            inner.log_rows.push(row);
        }

        if let Some(result) = event.step_result.as_deref().and_then(TaskResult::parse) {
            let step = &mut inner.state.steps[number];
            if step.log_length == 0 {
                step.log_index = inner.log_offset + inner.log_rows.len() as i64;
            }
            step.result = result;
            step.stopped_at = Some(event.time);
        }
    }

    /// Starts the periodic flush, running until closed or cancelled
    pub fn run_daemon(self: &Arc<Self>) -> JoinHandle<()> {
        let reporter = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                if reporter.closed.load(Ordering::Acquire) || reporter.cancel.is_cancelled() {
                    break;
                }

                if let Err(e) = reporter.report_log(false).await {
                    tracing::debug!(task_id = reporter.task_id, "Log report failed: {}", e);
                }
                if let Err(e) = reporter.report_state().await {
                    tracing::debug!(task_id = reporter.task_id, "State report failed: {}", e);
                }

                tokio::select! {
                    _ = reporter.cancel.cancelled() => break,
                    _ = tokio::time::sleep(reporter.interval) => {}
                }
            }
        })
    }

    /// Submits unacknowledged rows
    ///
    /// With `no_more` the submission is final and every row must be
    /// acknowledged. The call is abandoned when the task context is done.
    pub async fn report_log(&self, no_more: bool) -> Result<(), ReportError> {
        self.bounded(Bound::TaskContext, self.send_log(no_more)).await
    }

    /// Submits the state snapshot and pending outputs
    ///
    /// The call is abandoned when the task context is done.
    pub async fn report_state(&self) -> Result<(), ReportError> {
        self.bounded(Bound::TaskContext, self.send_state()).await
    }

    async fn bounded<F>(&self, bound: Bound, work: F) -> Result<(), ReportError>
    where
        F: Future<Output = Result<(), ReportError>>,
    {
        match bound {
            Bound::TaskContext => tokio::select! {
                result = work => result,
                _ = self.cancel.cancelled() => Err(ReportError::Cancelled),
            },
            Bound::FinalAttempt => tokio::time::timeout(FINAL_ATTEMPT_TIMEOUT, work)
                .await
                .unwrap_or(Err(ReportError::TimedOut(FINAL_ATTEMPT_TIMEOUT))),
        }
    }

    async fn send_log(&self, no_more: bool) -> Result<(), ReportError> {
        let _client = self.client_lock.lock().await;

        let (offset, rows) = {
            let inner = self.lock();
            (inner.log_offset, inner.log_rows.clone())
        };
        let expected = offset + rows.len() as i64;

        let ack = self
            .client
            .update_log(self.task_id, offset, rows, no_more)
            .await?;
        if ack < offset {
            return Err(ReportError::LogsLost { ack, offset });
        }

        {
            let mut inner = self.lock();
            let acked = usize::try_from(ack - offset)
                .unwrap_or(usize::MAX)
                .min(inner.log_rows.len());
            inner.log_rows.drain(..acked);
            inner.log_offset = ack;
        }

        if no_more && ack < expected {
            return Err(ReportError::IncompleteLogs { ack, expected });
        }
        Ok(())
    }

    async fn send_state(&self) -> Result<(), ReportError> {
        let _client = self.client_lock.lock().await;

        let (state, outputs) = {
            let inner = self.lock();
            let outputs: HashMap<String, String> = inner
                .outputs
                .iter()
                .filter(|(k, _)| !inner.sent_outputs.contains(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            (inner.state.clone(), outputs)
        };

        let response = self.client.update_task(state, outputs).await?;

        {
            let mut inner = self.lock();
            inner.sent_outputs.extend(response.sent_outputs);
        }

        if response
            .state
            .is_some_and(|s| s.result == TaskResult::Cancelled)
        {
            tracing::info!(task_id = self.task_id, "Task cancelled by the control plane");
            self.cancel.cancel();
        }
        Ok(())
    }

    async fn send_final(&self) -> Result<(), ReportError> {
        self.send_log(true).await?;
        self.send_state().await
    }

    /// Finishes reporting
    ///
    /// A task without a result is failed with `last_words` (or a default
    /// message) as its final line. The final log and state submission is
    /// retried with backoff while the task context lives. Once it is done,
    /// one last attempt limited to a few seconds is made, so closing never
    /// outlives the task by more than that.
    pub async fn close(&self, last_words: &str) -> Result<(), ReportError> {
        self.closed.store(true, Ordering::Release);

        {
            let mut inner = self.lock();
            if inner.state.result.is_unspecified() {
                let words = if last_words.is_empty() {
                    "Early termination"
                } else {
                    last_words
                };
                for step in &mut inner.state.steps {
                    if step.result.is_unspecified() {
                        step.result = TaskResult::Cancelled;
                    }
                }
                inner.state.result = TaskResult::Failure;
                inner.log_rows.push(LogRow::now(self.redactor.redact(words)));
                inner.state.stopped_at = Some(chrono::Utc::now());
            } else if !last_words.is_empty() {
                inner
                    .log_rows
                    .push(LogRow::now(self.redactor.redact(last_words)));
            }
        }

        let mut delay = CLOSE_INITIAL_DELAY;
        loop {
            let bound = if self.cancel.is_cancelled() {
                Bound::FinalAttempt
            } else {
                Bound::TaskContext
            };

            let err = match self.bounded(bound, self.send_final()).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            if bound == Bound::FinalAttempt {
                tracing::warn!(task_id = self.task_id, "Giving up final report: {}", err);
                return Err(err);
            }
            if self.cancel.is_cancelled() {
                continue;
            }

            tracing::warn!(
                task_id = self.task_id,
                "Final report failed, retrying in {:?}: {}",
                delay,
                err
            );
            tokio::select! {
                _ = self.cancel.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(CLOSE_MAX_DELAY);
        }
    }
}

impl LogSink for Reporter {
    fn fire(&self, event: LogEvent) {
        tracing::trace!(task_id = self.task_id, "{}", event.message);
        self.apply(&event);
        if !event.outputs.is_empty() {
            self.set_outputs(event.outputs);
        }
    }
}
