//! Relay control-plane client
//!
//! The runner consumes exactly four operations from the control plane:
//! fetching a task, streaming log rows, reporting task state, and
//! registering. They are expressed as the [`ControlPlane`] trait so the
//! scheduler and reporter can run against in-process fakes in tests.
//!
//! [`HttpControlPlane`] is the production implementation, speaking JSON over
//! HTTP to `<endpoint>/api/actions/runner.v1.RunnerService/<Method>`.
//!
//! # Example
//!
//! ```no_run
//! use relay_client::{ControlPlane, HttpControlPlane};
//!
//! #[tokio::main]
//! async fn main() -> relay_client::Result<()> {
//!     let client = HttpControlPlane::new("https://forge.example.com")
//!         .with_credentials("runner-uuid", "runner-token");
//!
//!     let (task, version) = client.fetch_task(0).await?;
//!     println!("task: {:?}, stream version {}", task.map(|t| t.id), version);
//!     Ok(())
//! }
//! ```

pub mod error;
mod runners;
mod tasks;

pub use error::{ClientError, Result};

use async_trait::async_trait;
use relay_core::domain::log::LogRow;
use relay_core::domain::runner::RunnerIdentity;
use relay_core::domain::task::{Task, TaskId, TaskState};
use relay_core::dto::runner::UpdateTaskResponse;
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::time::Duration;

/// Header carrying the registered runner's UUID
pub const UUID_HEADER: &str = "x-runner-uuid";
/// Header carrying the registered runner's token
pub const TOKEN_HEADER: &str = "x-runner-token";

const SERVICE_PATH: &str = "/api/actions/runner.v1.RunnerService";

/// Upper bound on a single control-plane request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capability interface over the control plane
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Asks for one task. Returns the task, if any, and the server's current
    /// task-stream version.
    async fn fetch_task(&self, task_version: i64) -> Result<(Option<Task>, i64)>;

    /// Submits log rows starting at absolute index `offset`; returns the
    /// server's acknowledgement index.
    async fn update_log(
        &self,
        task_id: TaskId,
        offset: i64,
        rows: Vec<LogRow>,
        no_more: bool,
    ) -> Result<i64>;

    /// Submits a full state snapshot plus not-yet-sent outputs.
    async fn update_task(
        &self,
        state: TaskState,
        outputs: HashMap<String, String>,
    ) -> Result<UpdateTaskResponse>;

    /// Registers a new runner with a one-time registration token.
    async fn register(&self, name: &str, token: &str, labels: &[String])
    -> Result<RunnerIdentity>;
}

/// HTTP client for the control-plane runner service
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    /// Base URL of the forge instance (e.g., "https://forge.example.com")
    endpoint: String,
    uuid: Option<String>,
    token: Option<String>,
    /// HTTP client instance
    client: Client,
}

impl HttpControlPlane {
    /// Create a new control-plane client
    ///
    /// # Example
    /// ```
    /// use relay_client::HttpControlPlane;
    ///
    /// let client = HttpControlPlane::new("http://localhost:3000/");
    /// assert_eq!(client.endpoint(), "http://localhost:3000");
    /// ```
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self::with_client(endpoint, Client::new())
    }

    /// Create a new client with a custom HTTP client
    ///
    /// This allows you to configure timeouts, proxies, TLS settings, etc.
    pub fn with_client(endpoint: impl Into<String>, client: Client) -> Self {
        let endpoint = endpoint.into();
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            uuid: None,
            token: None,
            client,
        }
    }

    /// Builds a client that skips certificate verification when `insecure`
    ///
    /// Requests give up after [`REQUEST_TIMEOUT`].
    pub fn build(endpoint: impl Into<String>, insecure: bool) -> Result<Self> {
        Self::build_with_timeout(endpoint, insecure, REQUEST_TIMEOUT)
    }

    pub fn build_with_timeout(
        endpoint: impl Into<String>,
        insecure: bool,
        timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(insecure)
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()?;
        Ok(Self::with_client(endpoint, client))
    }

    /// Attaches the identity of a registered runner to every request
    pub fn with_credentials(mut self, uuid: impl Into<String>, token: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into()).filter(|s: &String| !s.is_empty());
        self.token = Some(token.into()).filter(|s: &String| !s.is_empty());
        self
    }

    /// Get the forge endpoint this client talks to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}{}/{}", self.endpoint, SERVICE_PATH, method)
    }

    /// Posts a JSON body to a runner-service method and decodes the response
    async fn call<B, T>(&self, method: &str, body: &B) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut request = self.client.post(self.method_url(method)).json(body);
        if let Some(uuid) = &self.uuid {
            request = request.header(UUID_HEADER, uuid);
        }
        if let Some(token) = &self.token {
            request = request.header(TOKEN_HEADER, token);
        }

        tracing::trace!(method, "calling control plane");
        let response = request.send().await?;
        self.handle_response(response).await
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if status == reqwest::StatusCode::CONFLICT {
            return Err(ClientError::DataLock);
        }

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn fetch_task(&self, task_version: i64) -> Result<(Option<Task>, i64)> {
        HttpControlPlane::fetch_task(self, task_version).await
    }

    async fn update_log(
        &self,
        task_id: TaskId,
        offset: i64,
        rows: Vec<LogRow>,
        no_more: bool,
    ) -> Result<i64> {
        HttpControlPlane::update_log(self, task_id, offset, rows, no_more).await
    }

    async fn update_task(
        &self,
        state: TaskState,
        outputs: HashMap<String, String>,
    ) -> Result<UpdateTaskResponse> {
        HttpControlPlane::update_task(self, state, outputs).await
    }

    async fn register(
        &self,
        name: &str,
        token: &str,
        labels: &[String],
    ) -> Result<RunnerIdentity> {
        HttpControlPlane::register(self, name, token, labels).await
    }
}
