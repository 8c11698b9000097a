//! Runner registration
//!
//! The identity obtained from `register` is persisted as JSON and loaded by
//! the daemon on startup.

use anyhow::{Context, Result};
use relay_client::ControlPlane;
use serde::{Deserialize, Serialize};
use std::path::Path;

const WARNING: &str = "This file is automatically generated by relay-runner. Do not edit it manually unless you know what you are doing. Removing this file will cause relay-runner to re-register as a new runner.";

/// Persisted runner identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    #[serde(rename = "WARNING", default)]
    pub warning: String,

    pub id: i64,
    pub uuid: String,
    pub name: String,
    pub token: String,

    /// Control-plane endpoint the runner registered with
    pub address: String,

    #[serde(default)]
    pub labels: Vec<String>,
}

impl Registration {
    /// Registers a new runner and returns the identity to persist
    pub async fn register(
        client: &dyn ControlPlane,
        address: &str,
        name: &str,
        token: &str,
        labels: Vec<String>,
    ) -> Result<Self> {
        let identity = client
            .register(name, token, &labels)
            .await
            .context("Failed to register runner")?;

        Ok(Self {
            warning: WARNING.to_string(),
            id: identity.id,
            uuid: identity.uuid,
            name: identity.name,
            token: identity.token,
            address: address.to_string(),
            labels,
        })
    }

    /// Loads a registration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read registration file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid registration file {}", path.display()))
    }

    /// Writes the registration file, replacing any previous one
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut reg = self.clone();
        reg.warning = WARNING.to_string();

        let content = serde_json::to_string_pretty(&reg)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write registration file {}", path.display()))
    }
}
