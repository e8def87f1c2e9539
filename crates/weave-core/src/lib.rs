//! Parallel workflow execution engine core.
//!
//! Runs a user-defined DAG of tasks to completion with dependency
//! resolution, named-resource accounting, priority-aware scheduling, retry
//! and timeout handling, cooperative cancellation, and a lifecycle event
//! stream. See [`engine::Engine`] for the entry point.

pub mod builders;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod resolver;
pub mod resources;
pub mod scheduler;
pub mod toml_format;
pub mod types;

pub use builders::{TaskDefinitionBuilder, WorkflowDefinitionBuilder};
pub use engine::{ActiveWorkflowSnapshot, Engine, ExecuteOptions, WorkflowResult};
pub use error::{EngineError, TaskError};
pub use events::{Event, EventBus, Subscriber, SubscriptionId};
pub use resources::{AllocationKey, Cap, ResourceManager};
pub use toml_format::{RetryToml, TaskToml, WorkflowMeta, WorkflowToml, parse_workflow_toml};
pub use types::{
    BoxFuture, ExecCtx, FailureMode, IsolationLevel, Priority, ResourceRequirements, RetryPolicy,
    TaskBody, TaskDefinition, TaskId, TaskInput, TaskInstance, TaskState, TaskValue,
    WorkflowDefinition, WorkflowId, WorkflowInstance, WorkflowState,
};
