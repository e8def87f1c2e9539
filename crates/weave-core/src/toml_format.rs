//! TOML workflow definition format: the on-disk way to author a
//! [`WorkflowDefinition`] without writing Rust.
//!
//! Deserializes a `WorkflowToml`, then validates it into the in-memory
//! `WorkflowDefinition` the engine runs. This module owns the schema and
//! the deserialize-then-validate step; it does not know how to run a task
//! body — callers provide a `task_body` factory (the CLI's is "run
//! `command` as a child process").

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::builders::{TaskDefinitionBuilder, WorkflowDefinitionBuilder};
use crate::error::EngineError;
use crate::types::{ErrorPattern, FailureMode, Priority, RetryPolicy, TaskBody, TaskDefinition, WorkflowDefinition};

/// Top-level structure of a workflow TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowToml {
    pub workflow: WorkflowMeta,
    #[serde(default, rename = "tasks")]
    pub tasks: Vec<TaskToml>,
}

/// Workflow-level metadata in `[workflow]`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowMeta {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Absent means unbounded.
    #[serde(default)]
    pub concurrency_limit: Option<usize>,
    #[serde(default = "default_fail_fast")]
    pub fail_fast: bool,
}

fn default_fail_fast() -> bool {
    true
}

/// A single `[[tasks]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskToml {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// The shell command this task runs. Interpretation (how it becomes a
    /// [`TaskBody`]) is up to the caller of [`WorkflowToml::build`].
    pub command: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_priority")]
    pub priority: String,
    #[serde(default)]
    pub resources: HashMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryToml>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_failure_mode")]
    pub failure_mode: String,
}

fn default_priority() -> String {
    "normal".to_string()
}

fn default_failure_mode() -> String {
    "fail_workflow".to_string()
}

/// A `[tasks.retry]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryToml {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    #[serde(default)]
    pub retryable_errors: Option<Vec<String>>,
}

/// Parse a workflow TOML document. Syntax errors are reported as
/// [`EngineError::BuilderError`], matching the engine's other builder-time
/// validation failures.
pub fn parse_workflow_toml(contents: &str) -> Result<WorkflowToml, EngineError> {
    toml::from_str(contents).map_err(|e| EngineError::BuilderError(format!("invalid workflow TOML: {e}")))
}

impl WorkflowToml {
    /// Build a [`WorkflowDefinition`] from the parsed TOML, running each
    /// task's `command` field through `task_body` to obtain the task's
    /// actual [`TaskBody`]. Performs the same builder-time validation as
    /// the Rust builder API (duplicate ids, unknown dependencies, cycles),
    /// since both paths end at [`WorkflowDefinitionBuilder::build`].
    pub fn build<F>(&self, task_body: F) -> Result<WorkflowDefinition, EngineError>
    where
        F: Fn(&TaskToml) -> std::sync::Arc<dyn TaskBody>,
    {
        let mut tasks = Vec::with_capacity(self.tasks.len());
        for task_toml in &self.tasks {
            tasks.push(build_task(task_toml, &task_body)?);
        }

        let mut builder = WorkflowDefinitionBuilder::new(self.workflow.id.clone(), self.workflow.name.clone())
            .description(self.workflow.description.clone())
            .fail_fast(self.workflow.fail_fast)
            .tasks(tasks);
        if let Some(limit) = self.workflow.concurrency_limit {
            builder = builder.concurrency_limit(limit);
        }
        builder.build()
    }
}

fn build_task<F>(task_toml: &TaskToml, task_body: &F) -> Result<TaskDefinition, EngineError>
where
    F: Fn(&TaskToml) -> std::sync::Arc<dyn TaskBody>,
{
    let priority = parse_priority(&task_toml.priority)?;
    let failure_mode = parse_failure_mode(&task_toml.failure_mode)?;

    let mut builder = TaskDefinitionBuilder::new(
        task_toml.id.clone(),
        task_toml.name.clone().unwrap_or_else(|| task_toml.id.clone()),
    )
    .body(task_body(task_toml))
    .dependencies(task_toml.depends_on.clone())
    .priority(priority)
    .failure_mode(failure_mode);

    for (name, amount) in &task_toml.resources {
        builder = builder.resource(name.clone(), *amount);
    }

    if let Some(timeout_ms) = task_toml.timeout_ms {
        if timeout_ms == 0 {
            return Err(EngineError::BuilderError(format!(
                "task {:?} has timeout_ms = 0, which is not a valid deadline",
                task_toml.id
            )));
        }
        builder = builder.timeout(Duration::from_millis(timeout_ms));
    }

    if let Some(retry) = &task_toml.retry {
        builder = builder.retry_policy(RetryPolicy {
            max_retries: retry.max_retries,
            initial_delay: Duration::from_millis(retry.initial_delay_ms),
            backoff_factor: retry.backoff_factor,
            max_delay: Duration::from_millis(retry.max_delay_ms),
            retryable_errors: retry
                .retryable_errors
                .as_ref()
                .map(|patterns| patterns.iter().map(|p| ErrorPattern::from_str_heuristic(p)).collect()),
        });
    }

    builder.build()
}

fn parse_priority(s: &str) -> Result<Priority, EngineError> {
    s.parse()
        .map_err(|_| EngineError::BuilderError(format!("invalid priority: {s:?}")))
}

fn parse_failure_mode(s: &str) -> Result<FailureMode, EngineError> {
    match s {
        "fail_workflow" => Ok(FailureMode::FailWorkflow),
        "continue_workflow" => Ok(FailureMode::ContinueWorkflow),
        other => Err(EngineError::BuilderError(format!(
            "invalid failure_mode: {other:?} (expected \"fail_workflow\" or \"continue_workflow\")"
        ))),
    }
}
