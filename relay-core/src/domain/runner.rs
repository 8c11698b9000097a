//! Runner domain model
//!
//! Identity the control plane hands back when a runner registers.

use serde::{Deserialize, Serialize};

/// A registered runner
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunnerIdentity {
    /// Numeric id assigned by the control plane
    pub id: i64,

    /// Stable runner UUID, sent with every subsequent request
    pub uuid: String,

    pub name: String,

    /// Long-lived runner token (replaces the one-time registration token)
    pub token: String,
}
