//! Service layer
//!
//! Services contain the business logic of running a task: streaming its
//! progress to the control plane, driving the workflow engine, and tying
//! both together per dispatched task.
//!
//! The engine sits behind a trait so tests can swap in a stub.

pub mod dispatch;
pub mod engine;
pub mod reporter;

// Re-export traits
pub use engine::WorkflowEngine;
pub use reporter::LogSink;

// Re-export implementations
pub use dispatch::TaskRunner;
pub use engine::ProcessEngine;
pub use reporter::Reporter;
