//! Task poller
//!
//! Fetches tasks from the control plane and dispatches each one on its own
//! tokio task. At most `capacity` tasks run at once, and fetch requests are
//! spaced at least `fetch_interval` apart no matter how many slots are free.

use anyhow::Result;
use async_trait::async_trait;
use relay_client::{ClientError, ControlPlane};
use relay_core::domain::task::Task;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;

/// Runs one fetched task to completion
///
/// `cancel` fires when the task times out, when the control plane cancels
/// it, or when the runner is torn down.
#[async_trait]
pub trait Dispatch: Send + Sync {
    async fn dispatch(&self, task: Task, cancel: CancellationToken) -> Result<()>;
}

/// Pacing and concurrency settings of the poller
#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub capacity: usize,
    pub fetch_timeout: Duration,
    pub fetch_interval: Duration,
    pub retry_delay: Duration,
    pub task_timeout: Duration,
}

impl From<&Config> for PollerConfig {
    fn from(config: &Config) -> Self {
        Self {
            capacity: config.capacity.max(1),
            fetch_timeout: config.fetch_timeout,
            fetch_interval: config.fetch_interval,
            retry_delay: config.retry_delay,
            task_timeout: config.timeout,
        }
    }
}

pub struct Poller {
    config: PollerConfig,
    client: Arc<dyn ControlPlane>,
    dispatcher: Arc<dyn Dispatch>,

    /// Busy-worker gate
    busy: Mutex<usize>,
    ready: Notify,

    /// Last task-stream version reported by the server
    task_version: AtomicI64,

    tracker: TaskTracker,
    /// Parent of every task's cancellation token
    root: CancellationToken,
}

impl Poller {
    /// Creates a poller; cancelling `root` cancels every running task
    pub fn new(
        config: PollerConfig,
        client: Arc<dyn ControlPlane>,
        dispatcher: Arc<dyn Dispatch>,
        root: CancellationToken,
    ) -> Self {
        Self {
            config,
            client,
            dispatcher,
            busy: Mutex::new(0),
            ready: Notify::new(),
            task_version: AtomicI64::new(0),
            tracker: TaskTracker::new(),
            root,
        }
    }

    fn busy(&self) -> MutexGuard<'_, usize> {
        self.busy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of tasks currently running
    pub fn busy_workers(&self) -> usize {
        *self.busy()
    }

    /// Signals readiness when a slot is free
    ///
    /// At most one readiness signal is ever pending.
    fn schedule(&self) {
        let busy = self.busy();
        if *busy >= self.config.capacity {
            return;
        }
        self.ready.notify_one();
    }

    /// Fetches and dispatches tasks until `shutdown` is cancelled
    ///
    /// Running tasks are not affected by `shutdown`; use [`Poller::wait`]
    /// to drain them.
    pub async fn poll(self: &Arc<Self>, shutdown: CancellationToken) {
        info!(
            "Starting task poller (capacity: {}, fetch interval: {:?})",
            self.config.capacity, self.config.fetch_interval
        );

        let mut limiter = time::interval(self.config.fetch_interval);
        limiter.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            self.schedule();

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.ready.notified() => {}
            }

            if !self.acquire(&mut limiter, &shutdown).await {
                break;
            }
        }

        info!("Task poller stopped");
    }

    /// Fetches until one task has been dispatched; false on shutdown
    async fn acquire(self: &Arc<Self>, limiter: &mut time::Interval, shutdown: &CancellationToken) -> bool {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return false,
                _ = limiter.tick() => {}
            }

            match self.fetch().await {
                Ok(Some(task)) => {
                    self.spawn(task);
                    return true;
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Failed to fetch task: {}", e);
                    tokio::select! {
                        _ = shutdown.cancelled() => return false,
                        _ = time::sleep(self.config.retry_delay) => {}
                    }
                }
            }
        }
    }

    /// One fetch request; timeouts and lost races count as "no task"
    async fn fetch(&self) -> Result<Option<Task>, ClientError> {
        let version = self.task_version.load(Ordering::Acquire);
        trace!("Requesting task (version {})", version);

        let response = match time::timeout(
            self.config.fetch_timeout,
            self.client.fetch_task(version),
        )
        .await
        {
            Err(_) => {
                trace!("No task returned before the fetch timeout");
                return Ok(None);
            }
            Ok(Err(ClientError::DataLock)) => {
                info!("Task accepted by another runner");
                return Ok(None);
            }
            Ok(Err(e)) if e.is_timeout() => {
                trace!("Fetch timed out: {}", e);
                return Ok(None);
            }
            Ok(Err(e)) => return Err(e),
            Ok(Ok(response)) => response,
        };

        let (task, version) = response;
        self.task_version.store(version, Ordering::Release);

        match task {
            Some(task) if task.id != 0 => {
                // force the server to query its store on the next request
                self.task_version.store(0, Ordering::Release);
                Ok(Some(task))
            }
            _ => Ok(None),
        }
    }

    /// Runs `task` in a new slot
    fn spawn(self: &Arc<Self>, task: Task) {
        *self.busy() += 1;

        let poller = Arc::clone(self);
        self.tracker.spawn(async move {
            let task_id = task.id;
            info!(task_id, "Dispatching task");

            let cancel = poller.root.child_token();
            let dispatcher = Arc::clone(&poller.dispatcher);
            let token = cancel.clone();
            let mut unit = tokio::spawn(async move { dispatcher.dispatch(task, token).await });

            let result = tokio::select! {
                result = &mut unit => result,
                _ = time::sleep(poller.config.task_timeout) => {
                    warn!(task_id, "Task exceeded {:?}, cancelling", poller.config.task_timeout);
                    cancel.cancel();
                    unit.await
                }
            };
            cancel.cancel();

            match result {
                Ok(Ok(())) => debug!(task_id, "Task finished"),
                Ok(Err(e)) => error!(task_id, "Failed to execute task: {:#}", e),
                Err(e) if e.is_panic() => error!(task_id, "Task panicked: {}", e),
                Err(e) => error!(task_id, "Task aborted: {}", e),
            }

            poller.release();
        });
    }

    fn release(&self) {
        {
            let mut busy = self.busy();
            *busy = busy.saturating_sub(1);
        }
        self.schedule();
    }

    /// Waits for every dispatched task to return
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
