use crate::FlowId;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification recorded in `FlowState::last_error` and on failed steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    ValidationError,
    CycleDetected,
    UnknownDependency,
    StepExecutionError,
    StepTimedOut,
    UnconfirmedStepOnCrash,
    ConcurrencyConflict,
    InvalidOperation,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::ValidationError => "validation_error",
            ErrorKind::CycleDetected => "cycle_detected",
            ErrorKind::UnknownDependency => "unknown_dependency",
            ErrorKind::StepExecutionError => "step_execution_error",
            ErrorKind::StepTimedOut => "step_timed_out",
            ErrorKind::UnconfirmedStepOnCrash => "unconfirmed_step_on_crash",
            ErrorKind::ConcurrencyConflict => "concurrency_conflict",
            ErrorKind::InvalidOperation => "invalid_operation",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("Definition error: {0}")]
    Definition(#[from] DefinitionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Unknown flow type: {0}")]
    UnknownFlowType(String),

    #[error("Unknown step type: {0}")]
    UnknownStepType(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl FlowError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FlowError::Definition(e) => e.kind(),
            FlowError::Store(StoreError::ConcurrencyConflict { .. }) => ErrorKind::ConcurrencyConflict,
            FlowError::InvalidOperation(_) => ErrorKind::InvalidOperation,
            FlowError::UnknownFlowType(_) | FlowError::UnknownStepType(_) => ErrorKind::ValidationError,
            _ => ErrorKind::StepExecutionError,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, FlowError::Store(StoreError::ConcurrencyConflict { .. }))
    }
}

/// Errors raised while validating a flow definition at load time.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DefinitionError {
    #[error("Invalid definition: {0}")]
    Validation(String),

    #[error("Cyclic dependency detected at step '{0}'")]
    CycleDetected(String),

    #[error("Step '{step}' references unknown {what} '{name}'")]
    UnknownDependency {
        step: String,
        what: &'static str,
        name: String,
    },
}

impl DefinitionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DefinitionError::Validation(_) => ErrorKind::ValidationError,
            DefinitionError::CycleDetected(_) => ErrorKind::CycleDetected,
            DefinitionError::UnknownDependency { .. } => ErrorKind::UnknownDependency,
        }
    }
}

/// Failure reported by a step implementation.
#[derive(Error, Debug, Clone)]
pub enum StepError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInput {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Timeout after {millis}ms")]
    Timeout { millis: u64 },

    #[error("Cancelled")]
    Cancelled,
}

impl StepError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StepError::Timeout { .. } => ErrorKind::StepTimedOut,
            _ => ErrorKind::StepExecutionError,
        }
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Flow not found: {0}")]
    NotFound(FlowId),

    #[error("Concurrency conflict on flow {flow_id}: expected version {expected}, found {found}")]
    ConcurrencyConflict {
        flow_id: FlowId,
        expected: u64,
        found: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
