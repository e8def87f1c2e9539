//! The engine's error taxonomy.
//!
//! Library errors use `thiserror`; the CLI boundary uses `anyhow` instead.

use thiserror::Error;

use crate::types::{TaskId, WorkflowId};

/// An error surfaced by a task body, carrying the original message and an
/// optional kind tag for pattern matching against `retryable_errors`.
#[derive(Debug, Clone)]
pub struct TaskError {
    pub message: String,
    pub kind: Option<String>,
}

impl TaskError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
        }
    }

    pub fn with_kind(message: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: Some(kind.into()),
        }
    }
}

impl std::fmt::Display for TaskError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for TaskError {}

/// Framework-level and task-level errors the engine can produce.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("dependency cycle detected: {cycle:?}")]
    CycleError { cycle: Vec<TaskId> },

    #[error("task {task_id:?} depends on unknown task {missing_id:?}")]
    MissingDependencyError { task_id: TaskId, missing_id: TaskId },

    #[error("duplicate task id: {0:?}")]
    DuplicateTaskIdError(TaskId),

    #[error("input resolution failed for task {task_id:?}: {message}")]
    InputResolutionError { task_id: TaskId, message: String },

    #[error("task {task_id:?} timed out after {timeout_ms}ms")]
    TaskTimeoutError { task_id: TaskId, timeout_ms: u64 },

    #[error("resource {resource:?} unavailable: need {need}, have {have}")]
    ResourceUnavailableError {
        resource: String,
        need: f64,
        have: f64,
    },

    #[error("task {task_id:?} failed: {message}")]
    UserTaskError {
        task_id: TaskId,
        message: String,
        kind: Option<String>,
    },

    #[error("task {task_id:?} cancelled")]
    CancelledError { task_id: TaskId },

    #[error("workflow {workflow_id:?} is already active")]
    WorkflowAlreadyActiveError { workflow_id: WorkflowId },

    #[error(
        "workflow {workflow_id:?} stalled: task {task_id:?} requests {need} of resource \
         {resource:?} which exceeds the cap of {cap}"
    )]
    ResourceStarvationError {
        workflow_id: WorkflowId,
        task_id: TaskId,
        resource: String,
        need: f64,
        cap: f64,
    },

    #[error("builder error: {0}")]
    BuilderError(String),
}

impl EngineError {
    /// The error "kind" tag used for pattern matching against
    /// `retry_policy.retryable_errors`.
    pub fn kind_tag(&self) -> &'static str {
        match self {
            EngineError::CycleError { .. } => "CycleError",
            EngineError::MissingDependencyError { .. } => "MissingDependencyError",
            EngineError::DuplicateTaskIdError(_) => "DuplicateTaskIdError",
            EngineError::InputResolutionError { .. } => "InputResolutionError",
            EngineError::TaskTimeoutError { .. } => "TaskTimeoutError",
            EngineError::ResourceUnavailableError { .. } => "ResourceUnavailableError",
            EngineError::UserTaskError { .. } => "UserTaskError",
            EngineError::CancelledError { .. } => "CancelledError",
            EngineError::WorkflowAlreadyActiveError { .. } => "WorkflowAlreadyActiveError",
            EngineError::ResourceStarvationError { .. } => "ResourceStarvationError",
            EngineError::BuilderError(_) => "BuilderError",
        }
    }

    /// Whether this error kind is retryable *by default* (absent an
    /// explicit `retryable_errors` allowlist).
    pub fn retryable_by_default(&self) -> bool {
        matches!(
            self,
            EngineError::TaskTimeoutError { .. } | EngineError::UserTaskError { .. }
        )
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        match self {
            EngineError::MissingDependencyError { task_id, .. }
            | EngineError::InputResolutionError { task_id, .. }
            | EngineError::TaskTimeoutError { task_id, .. }
            | EngineError::UserTaskError { task_id, .. }
            | EngineError::CancelledError { task_id, .. }
            | EngineError::ResourceStarvationError { task_id, .. } => Some(task_id),
            _ => None,
        }
    }
}
