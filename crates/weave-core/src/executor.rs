//! Task executor: runs a single attempt of a task body to completion,
//! subject to a timeout and cooperative cancellation, and decides whether a
//! failed attempt should be retried.
//!
//! Drives an attempt through the same shape a subprocess harness would:
//! spawn, race against a deadline, interpret the outcome, decide on retry —
//! just over an arbitrary async task body rather than a subprocess.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::EngineError;
use crate::types::{ErrorPattern, RetryPolicy, TaskDefinition, TaskId, TaskValue};

/// The outcome of running one attempt of a task.
#[derive(Debug, Clone)]
pub enum AttemptOutcome {
    Completed(TaskValue),
    Failed(EngineError),
    Cancelled,
    TimedOut,
}

/// Run a single attempt of `task` with `input`, under `workflow_cancel`.
///
/// The per-attempt cancellation token is the union of the workflow-wide
/// cancellation token and a fresh per-attempt timeout token, so either
/// firing tears down the attempt the same way. `tokio::select!` races the
/// task body's future, the timeout, and workflow cancellation; whichever
/// resolves first determines the outcome.
pub async fn execute_attempt(
    task: &TaskDefinition,
    task_id: &TaskId,
    input: TaskValue,
    workflow_cancel: &CancellationToken,
) -> AttemptOutcome {
    execute_attempt_with_context(task, task_id, input, workflow_cancel, None).await
}

/// As [`execute_attempt`], but threads an opaque context bag into
/// [`crate::types::ExecCtx::context`] (`ExecuteOptions.context`).
pub async fn execute_attempt_with_context(
    task: &TaskDefinition,
    task_id: &TaskId,
    input: TaskValue,
    workflow_cancel: &CancellationToken,
    context: Option<Arc<dyn std::any::Any + Send + Sync>>,
) -> AttemptOutcome {
    let attempt_cancel = workflow_cancel.child_token();
    let ctx = crate::types::ExecCtx {
        cancel: attempt_cancel.clone(),
        context,
    };

    let body = task.body.clone();
    let body_fut = body.execute(input, ctx);
    tokio::pin!(body_fut);

    let timeout_fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
        match task.timeout {
            Some(d) => Box::pin(tokio::time::sleep(d)),
            None => Box::pin(std::future::pending()),
        };
    tokio::pin!(timeout_fut);

    tokio::select! {
        biased;
        _ = workflow_cancel.cancelled() => {
            attempt_cancel.cancel();
            AttemptOutcome::Cancelled
        }
        _ = &mut timeout_fut => {
            attempt_cancel.cancel();
            AttemptOutcome::TimedOut
        }
        result = &mut body_fut => {
            match result {
                Ok(value) => AttemptOutcome::Completed(value),
                Err(task_err) => AttemptOutcome::Failed(EngineError::UserTaskError {
                    task_id: task_id.clone(),
                    message: task_err.message,
                    kind: task_err.kind,
                }),
            }
        }
    }
}

/// Whether `error` is eligible for retry under `policy`: absent an explicit
/// `retryable_errors` allowlist, an error is retryable if
/// `EngineError::retryable_by_default` says so; otherwise it must match at
/// least one configured pattern (regex against the message, substring
/// against the message, or exact match against the error's kind tag).
pub fn is_retryable(error: &EngineError, policy: &RetryPolicy) -> bool {
    match &policy.retryable_errors {
        None => error.retryable_by_default(),
        Some(patterns) => {
            let message = error.to_string();
            let kind = error.kind_tag();
            patterns.iter().any(|pattern| match pattern {
                ErrorPattern::Substring(s) => message.contains(s.as_str()),
                ErrorPattern::Regex(pattern) => regex::Regex::new(pattern)
                    .map(|re| re.is_match(&message))
                    .unwrap_or(false),
                ErrorPattern::Kind(k) => k == kind,
            })
        }
    }
}

/// Decide what should happen after `outcome`: whether the attempt should be
/// retried, and if so, after how long.
pub enum RetryDecision {
    /// The task is done (succeeded, or failed/cancelled with no more
    /// retries left).
    Final,
    /// Retry after `delay`.
    Retry { delay: Duration },
}

pub fn decide_retry(
    outcome: &AttemptOutcome,
    retry_count: u32,
    policy: Option<&RetryPolicy>,
    task_id: &TaskId,
    timeout_ms: u64,
) -> RetryDecision {
    // A timeout is represented as a real `TaskTimeoutError` here (not just
    // treated specially), so `retryableErrors` patterns match it exactly
    // the way they'd match any other error kind/message.
    let timeout_error;
    let error = match outcome {
        AttemptOutcome::Completed(_) => return RetryDecision::Final,
        AttemptOutcome::Cancelled => return RetryDecision::Final,
        AttemptOutcome::TimedOut => {
            timeout_error = EngineError::TaskTimeoutError {
                task_id: task_id.clone(),
                timeout_ms,
            };
            &timeout_error
        }
        AttemptOutcome::Failed(e) => e,
    };

    let Some(policy) = policy else {
        return RetryDecision::Final;
    };
    if retry_count >= policy.max_retries {
        return RetryDecision::Final;
    }

    if !is_retryable(error, policy) {
        return RetryDecision::Final;
    }

    RetryDecision::Retry {
        delay: policy.delay_for_retry(retry_count + 1),
    }
}
