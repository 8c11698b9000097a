//! Relay Runner
//!
//! A self-hosted CI agent that executes workflow jobs through an external
//! engine.
//!
//! Architecture:
//! - Configuration: Load settings from environment or defaults
//! - Registration: One-time identity exchange with the control plane
//! - Scheduler: Bounded, rate-limited task polling
//! - Services: Per-task reporting, engine execution and dispatch
//!
//! The daemon also hosts an artifact cache that jobs reach through
//! `ACTIONS_CACHE_URL`.

pub mod config;
pub mod registration;
pub mod scheduler;
pub mod service;
#[cfg(test)]
mod testing;
