//! Engine error taxonomy.

use thiserror::Error;
use uuid::Uuid;

use crate::workflow::ExecutionStatus;

/// Errors surfaced by the workflow engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("template '{id}' version '{version}' is already published")]
    TemplateExists { id: String, version: String },

    #[error("execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle detected involving steps: {}", .0.join(", "))]
    CycleDetected(Vec<String>),

    #[error("deadlock: no pending step can become ready ({})", .0.join(", "))]
    Deadlock(Vec<String>),

    #[error("invalid state transition: {from:?} -> {to:?}")]
    InvalidStateTransition {
        from: ExecutionStatus,
        to: ExecutionStatus,
    },

    #[error("step '{step_id}' failed: {error}")]
    StepFailed { step_id: String, error: String },

    #[error("invalid policy: {0}")]
    Policy(String),
}
