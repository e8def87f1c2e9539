//! Shared builders and fixtures for weave-core/weave-cli tests.
//!
//! There is nothing to provision for an in-memory engine, so these helpers
//! just build ready-to-run [`WorkflowDefinition`]s and
//! [`TaskDefinition`]s for common shapes (a task that always succeeds, one
//! that fails a fixed number of times before succeeding, one that sleeps).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use weave_core::{
    EngineError, ExecCtx, TaskDefinition, TaskDefinitionBuilder, TaskError, TaskValue,
    WorkflowDefinition, WorkflowDefinitionBuilder,
};

/// A task that immediately succeeds, echoing its input back as its output.
pub fn echo_task(id: impl Into<String>) -> TaskDefinition {
    let id = id.into();
    TaskDefinitionBuilder::new(id.clone(), id)
        .body_fn(|input: TaskValue, _ctx: ExecCtx| Box::pin(async move { Ok(input) }))
        .build()
        .expect("echo_task builds")
}

/// A task depending on `deps` that immediately succeeds with `value`.
pub fn value_task(id: impl Into<String>, deps: &[&str], value: TaskValue) -> TaskDefinition {
    let id = id.into();
    TaskDefinitionBuilder::new(id.clone(), id)
        .dependencies(deps.iter().map(|s| s.to_string()).collect())
        .body_fn(move |_input, _ctx| {
            let value = value.clone();
            Box::pin(async move { Ok(value) })
        })
        .build()
        .expect("value_task builds")
}

/// A task that always fails with `message`.
pub fn failing_task(id: impl Into<String>, message: impl Into<String> + Clone + Send + 'static) -> TaskDefinition {
    let id = id.into();
    TaskDefinitionBuilder::new(id.clone(), id)
        .body_fn(move |_input, _ctx| {
            let message = message.clone();
            Box::pin(async move { Err(TaskError::new(message.into())) })
        })
        .build()
        .expect("failing_task builds")
}

/// A task that fails `fail_count` times, then succeeds with `json!("ok")`.
/// Returns the task alongside an `Arc<AtomicUsize>` tracking attempts made,
/// for assertions on retry counts.
pub fn flaky_task(
    id: impl Into<String>,
    fail_count: usize,
    retry_policy: weave_core::RetryPolicy,
) -> (TaskDefinition, Arc<AtomicUsize>) {
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = attempts.clone();
    let id = id.into();
    let task = TaskDefinitionBuilder::new(id.clone(), id)
        .retry_policy(retry_policy)
        .body_fn(move |_input, _ctx| {
            let attempts = attempts_clone.clone();
            Box::pin(async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < fail_count {
                    Err(TaskError::new(format!("attempt {n} failing")))
                } else {
                    Ok(json!("ok"))
                }
            })
        })
        .build()
        .expect("flaky_task builds");
    (task, attempts)
}

/// A task that sleeps for `duration` before succeeding, observing
/// cancellation cooperatively so cancellation tests don't have to wait out
/// the full sleep.
pub fn sleeping_task(id: impl Into<String>, duration: Duration) -> TaskDefinition {
    let id = id.into();
    TaskDefinitionBuilder::new(id.clone(), id)
        .body_fn(move |_input, ctx: ExecCtx| {
            Box::pin(async move {
                let deadline = tokio::time::Instant::now() + duration;
                loop {
                    if ctx.is_cancelled() {
                        break;
                    }
                    if tokio::time::Instant::now() >= deadline {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
                Ok(json!(null))
            })
        })
        .build()
        .expect("sleeping_task builds")
}

/// Build a workflow from pre-built tasks with default policy
/// (`fail_fast = true`, no concurrency limit).
pub fn workflow(id: impl Into<String>, tasks: Vec<TaskDefinition>) -> Result<WorkflowDefinition, EngineError> {
    let id = id.into();
    WorkflowDefinitionBuilder::new(id.clone(), id).tasks(tasks).build()
}
