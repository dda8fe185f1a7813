//! Error types for the task engine.

use taskpilot_core::error::TaskPilotError;
use taskpilot_core::types::TaskState;
use uuid::Uuid;

use crate::state_machine::Trigger;

/// Failure of a single tool invocation.
///
/// These never escape the engine as `Err`: the orchestrator folds them into
/// a step outcome and the self-monitoring loop decides what happens next.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
    #[error("Argument validation failed: {0}")]
    Validation(String),
    #[error("External service error: {message}")]
    ExternalService { message: String, retryable: bool },
    #[error("Tool timed out after {0} seconds")]
    Timeout(u64),
    #[error("Denied by safety governor: {0}")]
    RiskDenied(String),
    #[error("Unrecoverable tool failure: {0}")]
    Unrecoverable(String),
}

impl ToolError {
    pub fn external(message: impl Into<String>, retryable: bool) -> Self {
        ToolError::ExternalService {
            message: message.into(),
            retryable,
        }
    }

    /// Transient failures worth retrying for idempotent actions.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ToolError::ExternalService { retryable: true, .. } | ToolError::Timeout(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ToolError::Validation(_) => "validation",
            ToolError::ExternalService { .. } => "external_service",
            ToolError::Timeout(_) => "timeout",
            ToolError::RiskDenied(_) => "risk_denied",
            ToolError::Unrecoverable(_) => "unrecoverable",
        }
    }
}

impl From<TaskPilotError> for ToolError {
    fn from(err: TaskPilotError) -> Self {
        match err {
            TaskPilotError::InvalidInput(msg) => ToolError::Validation(msg),
            other => ToolError::Unrecoverable(other.to_string()),
        }
    }
}

/// Errors from intent classification and plan construction.
#[derive(Debug, thiserror::Error)]
pub enum PlanningError {
    #[error("Reasoning service failed: {0}")]
    Reasoning(String),
    #[error("Malformed planner output: {0}")]
    Malformed(String),
    #[error("Planning failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

/// Errors surfaced by [`crate::TaskEngine`] operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Storage error: {0}")]
    Storage(TaskPilotError),
    #[error("Corrupt record: {0}")]
    Corrupt(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid state transition: {0} -> {1}")]
    InvalidTransition(TaskState, TaskState),
    #[error("Trigger {1} is not valid in state {0}")]
    UnexpectedTrigger(TaskState, Trigger),
    #[error("Task {0} is busy with another operation")]
    LockContention(Uuid),
    #[error("Task {0} is already {1}")]
    TerminalTask(Uuid, TaskState),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<TaskPilotError> for EngineError {
    fn from(err: TaskPilotError) -> Self {
        match err {
            TaskPilotError::NotFound(msg) => EngineError::NotFound(msg),
            TaskPilotError::Corrupt(msg) => EngineError::Corrupt(msg),
            TaskPilotError::InvalidInput(msg) => EngineError::InvalidInput(msg),
            TaskPilotError::Conflict(msg) => EngineError::Conflict(msg),
            TaskPilotError::Config(msg) => EngineError::Config(msg),
            other => EngineError::Storage(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
