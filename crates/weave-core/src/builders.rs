//! Fluent builders for [`TaskDefinition`] and [`WorkflowDefinition`], with
//! `build()`-time validation.
//!
//! There is no serialization format at this layer (the CLI's TOML workflow
//! format builds on top of these builders instead); required fields,
//! duplicate task ids, and unknown dependency references are all checked
//! at `.build()` time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::EngineError;
use crate::resolver;
use crate::types::{
    BoxFuture, FailureMode, IsolationLevel, Priority, ResourceRequirements, TaskBody,
    TaskDefinition, TaskId, TaskInput, TaskValue, WorkflowDefinition, WorkflowId,
};

/// Builds a single [`TaskDefinition`].
pub struct TaskDefinitionBuilder {
    id: TaskId,
    name: String,
    body: Option<Arc<dyn TaskBody>>,
    input: TaskInput,
    dependencies: Vec<TaskId>,
    priority: Priority,
    resources: ResourceRequirements,
    retry_policy: Option<crate::types::RetryPolicy>,
    timeout: Option<Duration>,
    failure_mode: FailureMode,
    isolation_level: IsolationLevel,
}

impl TaskDefinitionBuilder {
    pub fn new(id: impl Into<TaskId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            body: None,
            input: TaskInput::Static(TaskValue::Null),
            dependencies: Vec::new(),
            priority: Priority::default(),
            resources: HashMap::new(),
            retry_policy: None,
            timeout: None,
            failure_mode: FailureMode::default(),
            isolation_level: IsolationLevel::default(),
        }
    }

    pub fn body(mut self, body: Arc<dyn TaskBody>) -> Self {
        self.body = Some(body);
        self
    }

    /// Convenience for the common case: a closure returning a boxed future,
    /// without requiring callers to implement [`TaskBody`] by hand.
    pub fn body_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(TaskValue, crate::types::ExecCtx) -> BoxFuture<'static, Result<TaskValue, crate::error::TaskError>>
            + Send
            + Sync
            + 'static,
    {
        self.body = Some(Arc::new(f));
        self
    }

    pub fn input(mut self, input: impl Into<TaskInput>) -> Self {
        self.input = input.into();
        self
    }

    pub fn derived_input<F>(mut self, f: F) -> Self
    where
        F: Fn(&crate::types::ResultsView) -> Result<TaskValue, String> + Send + Sync + 'static,
    {
        self.input = TaskInput::Derived(Arc::new(f));
        self
    }

    pub fn dependencies(mut self, deps: Vec<TaskId>) -> Self {
        self.dependencies = deps;
        self
    }

    pub fn depends_on(mut self, dep: impl Into<TaskId>) -> Self {
        self.dependencies.push(dep.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn resource(mut self, name: impl Into<String>, amount: f64) -> Self {
        self.resources.insert(name.into(), amount);
        self
    }

    pub fn retry_policy(mut self, policy: crate::types::RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Set the per-attempt timeout. A zero duration is rejected at
    /// `build()` time as an invalid configuration.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    pub fn isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn build(self) -> Result<TaskDefinition, EngineError> {
        let body = self.body.ok_or_else(|| {
            EngineError::BuilderError(format!("task {:?} has no body", self.id))
        })?;
        if self.id.is_empty() {
            return Err(EngineError::BuilderError("task id must not be empty".into()));
        }
        for (name, amount) in &self.resources {
            if *amount < 0.0 {
                return Err(EngineError::BuilderError(format!(
                    "task {:?} requests negative amount of resource {:?}",
                    self.id, name
                )));
            }
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(EngineError::BuilderError(format!(
                "task {:?} has a zero timeout, which is not a valid deadline",
                self.id
            )));
        }

        Ok(TaskDefinition {
            id: self.id,
            name: self.name,
            body,
            input: self.input,
            dependencies: self.dependencies,
            priority: self.priority,
            resources: self.resources,
            retry_policy: self.retry_policy,
            timeout: self.timeout,
            failure_mode: self.failure_mode,
            isolation_level: self.isolation_level,
        })
    }
}

/// Builds a [`WorkflowDefinition`], validating the resulting task graph
/// (unique ids, resolvable dependencies, no cycles) at `build()` time.
pub struct WorkflowDefinitionBuilder {
    id: WorkflowId,
    name: String,
    description: String,
    tasks: Vec<TaskDefinition>,
    concurrency_limit: Option<usize>,
    fail_fast: bool,
    initial_results: HashMap<TaskId, TaskValue>,
}

impl WorkflowDefinitionBuilder {
    pub fn new(id: impl Into<WorkflowId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            tasks: Vec::new(),
            concurrency_limit: None,
            fail_fast: true,
            initial_results: HashMap::new(),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn tasks(mut self, tasks: Vec<TaskDefinition>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn task(mut self, task: TaskDefinition) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit);
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn initial_result(mut self, id: impl Into<TaskId>, value: TaskValue) -> Self {
        self.initial_results.insert(id.into(), value);
        self
    }

    pub fn build(self) -> Result<WorkflowDefinition, EngineError> {
        if self.id.is_empty() {
            return Err(EngineError::BuilderError("workflow id must not be empty".into()));
        }
        if self.tasks.is_empty() {
            return Err(EngineError::BuilderError(format!(
                "workflow {:?} has no tasks",
                self.id
            )));
        }

        let def = WorkflowDefinition {
            id: self.id,
            name: self.name,
            description: self.description,
            tasks: self.tasks,
            concurrency_limit: self.concurrency_limit,
            fail_fast: self.fail_fast,
            initial_results: self.initial_results,
        };

        resolver::validate(&def)?;

        Ok(def)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop_body() -> Arc<dyn TaskBody> {
        Arc::new(|_input: TaskValue, _ctx: crate::types::ExecCtx| -> BoxFuture<'static, Result<TaskValue, crate::error::TaskError>> {
            Box::pin(async { Ok(json!(null)) })
        })
    }

    #[test]
    fn task_without_body_fails() {
        let result = TaskDefinitionBuilder::new("a", "a").build();
        assert!(result.is_err());
    }

    #[test]
    fn negative_resource_fails() {
        let result = TaskDefinitionBuilder::new("a", "a")
            .body(noop_body())
            .resource("cpu", -1.0)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn zero_timeout_fails() {
        let result = TaskDefinitionBuilder::new("a", "a")
            .body(noop_body())
            .timeout(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn duplicate_task_id_rejected_at_workflow_build() {
        let t1 = TaskDefinitionBuilder::new("a", "a").body(noop_body()).build().unwrap();
        let t2 = TaskDefinitionBuilder::new("a", "a again").body(noop_body()).build().unwrap();
        let result = WorkflowDefinitionBuilder::new("wf", "wf").tasks(vec![t1, t2]).build();
        assert!(matches!(result, Err(EngineError::DuplicateTaskIdError(_))));
    }

    #[test]
    fn missing_dependency_rejected() {
        let t1 = TaskDefinitionBuilder::new("a", "a")
            .body(noop_body())
            .depends_on("ghost")
            .build()
            .unwrap();
        let result = WorkflowDefinitionBuilder::new("wf", "wf").tasks(vec![t1]).build();
        assert!(matches!(result, Err(EngineError::MissingDependencyError { .. })));
    }

    #[test]
    fn empty_workflow_rejected() {
        let result = WorkflowDefinitionBuilder::new("wf", "wf").build();
        assert!(result.is_err());
    }
}
