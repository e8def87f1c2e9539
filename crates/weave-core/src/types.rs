//! Core data model: tasks, workflows, and their runtime instances.
//!
//! Status enums follow a uniform Display/FromStr pattern; there is no
//! `sqlx::Type` derive because nothing here is ever persisted by the engine
//! itself.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;

/// Identifier for a task, unique within a single workflow definition.
pub type TaskId = String;

/// Identifier for a workflow definition / instance.
pub type WorkflowId = String;

/// The engine's universal value type for task inputs, outputs, and results.
///
/// Individual tasks are free to treat this as opaque structured data; the
/// engine itself never inspects it beyond storing and forwarding it.
pub type TaskValue = serde_json::Value;

/// A read-only snapshot of the results accumulated so far, handed to a
/// task's input-derivation function.
pub type ResultsView = Arc<HashMap<TaskId, TaskValue>>;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

// ---------------------------------------------------------------------------
// Priority
// ---------------------------------------------------------------------------

/// Task scheduling priority. Higher numeric value schedules first among
/// otherwise-tied ready tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Priority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = PriorityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(PriorityParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`Priority`] string.
#[derive(Debug, Clone)]
pub struct PriorityParseError(pub String);

impl fmt::Display for PriorityParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid priority: {:?}", self.0)
    }
}

impl std::error::Error for PriorityParseError {}

// ---------------------------------------------------------------------------
// FailureMode / IsolationLevel
// ---------------------------------------------------------------------------

/// Controls whether a terminal failure of a task fails the whole workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureMode {
    /// A terminal failure of this task fails the workflow (default).
    FailWorkflow,
    /// A terminal failure of this task is tolerated; downstream tasks that
    /// depend on it are skipped, but the workflow may still complete.
    ContinueWorkflow,
}

impl Default for FailureMode {
    fn default() -> Self {
        FailureMode::FailWorkflow
    }
}

/// Advisory isolation hint. The core guarantees `None`; `Process` is a hint
/// an embedding application may honor by running the task body in a child
/// process or worker. Open Questions: exact semantics of
/// `Process` are intentionally left undefined here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    None,
    Process,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::None
    }
}

// ---------------------------------------------------------------------------
// TaskState / WorkflowState
// ---------------------------------------------------------------------------

/// Runtime state of a single task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Skipped,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
            TaskState::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskState {
    type Err = TaskStateParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "running" => Ok(TaskState::Running),
            "completed" => Ok(TaskState::Completed),
            "failed" => Ok(TaskState::Failed),
            "cancelled" => Ok(TaskState::Cancelled),
            "skipped" => Ok(TaskState::Skipped),
            other => Err(TaskStateParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`TaskState`] string.
#[derive(Debug, Clone)]
pub struct TaskStateParseError(pub String);

impl fmt::Display for TaskStateParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid task state: {:?}", self.0)
    }
}

impl std::error::Error for TaskStateParseError {}

/// Runtime state of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkflowState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowState::Pending => "pending",
            WorkflowState::Running => "running",
            WorkflowState::Completed => "completed",
            WorkflowState::Failed => "failed",
            WorkflowState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl WorkflowState {
    /// Whether this state is terminal (no further transitions occur).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowState::Completed | WorkflowState::Failed | WorkflowState::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// A pattern used to decide whether an error is retryable.
#[derive(Debug, Clone)]
pub enum ErrorPattern {
    /// Matched as a substring of the error message.
    Substring(String),
    /// Matched as a regular expression against the error message.
    Regex(String),
    /// Matched against the error's kind tag (e.g. "TaskTimeoutError").
    Kind(String),
}

impl ErrorPattern {
    /// Build a pattern from a plain string: strings that parse as a regex
    /// *and* contain a regex metacharacter are treated as regexes; anything
    /// else is treated as a plain substring. This mirrors the ambiguity the
    /// spec leaves to "the framework's choice of representation."
    pub fn from_str_heuristic(s: &str) -> Self {
        const METACHARS: &[char] = &['*', '+', '?', '[', ']', '(', ')', '^', '$', '|', '\\'];
        if s.contains(METACHARS) && regex::Regex::new(s).is_ok() {
            ErrorPattern::Regex(s.to_string())
        } else {
            ErrorPattern::Substring(s.to_string())
        }
    }
}

/// Retry policy for a task: how many attempts, how long to wait between
/// them, and which errors are eligible.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub backoff_factor: f64,
    pub max_delay: Duration,
    /// Absent means "all errors are retryable up to max_retries".
    pub retryable_errors: Option<Vec<ErrorPattern>>,
}

impl RetryPolicy {
    /// Compute the delay before the `retry_count`-th retry (1-indexed),
    /// : `min(initialDelay * backoffFactor^retryCount, maxDelay)`.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        let factor = self.backoff_factor.powi(retry_count as i32);
        let scaled = self.initial_delay.as_secs_f64() * factor;
        let capped = scaled.min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }
}

// ---------------------------------------------------------------------------
// Resource requirements
// ---------------------------------------------------------------------------

/// Named, non-negative resource amounts a task attempt requires.
pub type ResourceRequirements = HashMap<String, f64>;

// ---------------------------------------------------------------------------
// Execution context / task body
// ---------------------------------------------------------------------------

/// Context passed to every task attempt: a cancellation handle (firing on
/// workflow cancellation or per-attempt timeout, whichever comes first) and
/// an opaque, user-supplied context bag threaded through unmodified.
#[derive(Clone)]
pub struct ExecCtx {
    pub cancel: CancellationToken,
    pub context: Option<Arc<dyn std::any::Any + Send + Sync>>,
}

impl ExecCtx {
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// The user-supplied body of a task.
///
/// Implementors wrap arbitrary async work (calls to external services,
/// subprocess invocations, pure computation). The trait is object-safe so
/// task bodies can be stored as `Arc<dyn TaskBody>` inside a
/// [`crate::builders::TaskDefinition`] the same way any other object-safe
/// work item would be.
#[async_trait]
pub trait TaskBody: Send + Sync {
    async fn execute(&self, input: TaskValue, ctx: ExecCtx) -> Result<TaskValue, TaskError>;
}

/// Blanket impl so any function returning a boxed future satisfies
/// [`TaskBody`], avoiding a wrapper struct for the common case.
#[async_trait]
impl<F> TaskBody for F
where
    F: Fn(TaskValue, ExecCtx) -> BoxFuture<'static, Result<TaskValue, TaskError>> + Send + Sync,
{
    async fn execute(&self, input: TaskValue, ctx: ExecCtx) -> Result<TaskValue, TaskError> {
        (self)(input, ctx).await
    }
}

/// A task's input: either a fixed value, or a function of the results
/// accumulated so far, evaluated just before the task executes.
#[derive(Clone)]
pub enum TaskInput {
    Static(TaskValue),
    Derived(Arc<dyn Fn(&ResultsView) -> Result<TaskValue, String> + Send + Sync>),
}

impl TaskInput {
    pub fn resolve(&self, results: &ResultsView) -> Result<TaskValue, String> {
        match self {
            TaskInput::Static(v) => Ok(v.clone()),
            TaskInput::Derived(f) => f(results),
        }
    }
}

impl From<TaskValue> for TaskInput {
    fn from(v: TaskValue) -> Self {
        TaskInput::Static(v)
    }
}

// ---------------------------------------------------------------------------
// TaskDefinition / WorkflowDefinition
// ---------------------------------------------------------------------------

/// Immutable, user-authored description of a task.
#[derive(Clone)]
pub struct TaskDefinition {
    pub id: TaskId,
    pub name: String,
    pub body: Arc<dyn TaskBody>,
    pub input: TaskInput,
    pub dependencies: Vec<TaskId>,
    pub priority: Priority,
    pub resources: ResourceRequirements,
    pub retry_policy: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
    pub failure_mode: FailureMode,
    pub isolation_level: IsolationLevel,
}

/// Immutable, user-authored description of a workflow: a DAG of tasks plus
/// scheduling policy.
#[derive(Clone)]
pub struct WorkflowDefinition {
    pub id: WorkflowId,
    pub name: String,
    pub description: String,
    pub tasks: Vec<TaskDefinition>,
    /// `None` means unbounded.
    pub concurrency_limit: Option<usize>,
    pub fail_fast: bool,
    pub initial_results: HashMap<TaskId, TaskValue>,
}

impl WorkflowDefinition {
    pub fn task(&self, id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn task_index(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == id)
    }
}

// ---------------------------------------------------------------------------
// TaskInstance / WorkflowInstance
// ---------------------------------------------------------------------------

/// Per-run, mutable runtime state for a single task.
#[derive(Debug, Clone)]
pub struct TaskInstance {
    pub id: TaskId,
    pub state: TaskState,
    pub retry_count: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub next_retry_time: Option<DateTime<Utc>>,
    pub error: Option<crate::error::EngineError>,
}

impl TaskInstance {
    pub fn new(id: TaskId) -> Self {
        Self {
            id,
            state: TaskState::Pending,
            retry_count: 0,
            start_time: None,
            end_time: None,
            next_retry_time: None,
            error: None,
        }
    }
}

/// Per-run, mutable runtime state for a whole workflow execution.
///
/// One instance is created per call to `Engine::execute` and lives for the
/// duration of that run; it is never reused across runs, even of the same
/// [`WorkflowDefinition`].
pub struct WorkflowInstance {
    pub id: WorkflowId,
    pub state: WorkflowState,
    pub tasks: HashMap<TaskId, TaskInstance>,
    pub results: HashMap<TaskId, TaskValue>,
    pub cancel_token: CancellationToken,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl WorkflowInstance {
    /// Build the initial instance for `def`: every task `Pending`, results
    /// seeded from `def.initial_results`, a fresh cancellation token.
    pub fn new(def: &WorkflowDefinition) -> Self {
        let tasks = def
            .tasks
            .iter()
            .map(|t| (t.id.clone(), TaskInstance::new(t.id.clone())))
            .collect();

        Self {
            id: def.id.clone(),
            state: WorkflowState::Pending,
            tasks,
            results: def.initial_results.clone(),
            cancel_token: CancellationToken::new(),
            start_time: None,
            end_time: None,
        }
    }

    /// Ids of tasks currently in a given state.
    pub fn ids_in_state(&self, state: TaskState) -> Vec<TaskId> {
        self.tasks
            .iter()
            .filter(|(_, inst)| inst.state == state)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Whether every task has reached a terminal state
    /// (Completed/Failed/Cancelled/Skipped).
    pub fn all_tasks_terminal(&self) -> bool {
        self.tasks.values().all(|inst| {
            matches!(
                inst.state,
                TaskState::Completed | TaskState::Failed | TaskState::Cancelled | TaskState::Skipped
            )
        })
    }

    /// A read-only, shareable snapshot of `results` for input derivation.
    pub fn results_view(&self) -> ResultsView {
        Arc::new(self.results.clone())
    }
}
