//! Data Transfer Objects for inter-service communication
//!
//! Request and response bodies exchanged with the control plane (`runner`)
//! and with the artifact cache HTTP surface (`cache`).

pub mod cache;
pub mod runner;
