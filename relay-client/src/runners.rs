//! Runner registration

use crate::HttpControlPlane;
use crate::error::Result;
use relay_core::domain::runner::RunnerIdentity;
use relay_core::dto::runner::{RegisterRequest, RegisterResponse};

impl HttpControlPlane {
    /// Register a runner with the control plane
    ///
    /// # Arguments
    /// * `name` - Display name of the runner
    /// * `token` - One-time registration token issued by the forge
    /// * `labels` - Labels the runner accepts jobs for
    ///
    /// # Returns
    /// The identity (uuid and long-lived token) of the new runner
    pub async fn register(
        &self,
        name: &str,
        token: &str,
        labels: &[String],
    ) -> Result<RunnerIdentity> {
        let response: RegisterResponse = self
            .call(
                "Register",
                &RegisterRequest {
                    name: name.to_string(),
                    token: token.to_string(),
                    agent_labels: labels.to_vec(),
                },
            )
            .await?;

        tracing::info!(
            "Registered runner {} (id {}, uuid {})",
            response.runner.name,
            response.runner.id,
            response.runner.uuid
        );

        Ok(response.runner)
    }
}
