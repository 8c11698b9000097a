//! Core domain types
//!
//! These types represent the entities the runner works with: tasks handed
//! out by the control plane, their execution state as reported back, log
//! output, and cache metadata. They are shared between the cache service
//! (for persistence) and the runner (for execution and reporting).

pub mod cache;
pub mod log;
pub mod runner;
pub mod task;
