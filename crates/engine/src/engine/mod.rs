//! Workflow engine: step execution and workflow-level state transitions

mod error;
mod operation;
mod service;

pub use error::EngineError;
pub use operation::{OperationExecutor, StepOutcome};
pub use service::WorkflowEngine;
