//! Scheduler layer for the runner
//!
//! This layer polls the control plane for tasks and bounds how many run
//! at once. What running a task means is left to a [`Dispatch`]
//! implementation.

pub mod poller;

pub use poller::{Dispatch, Poller, PollerConfig};
