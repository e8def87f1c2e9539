//! Turns a [`TaskToml`]'s `command` field into a runnable [`TaskBody`]: the
//! CLI's concrete answer to "how does a workflow TOML task actually run",
//! which `weave_core::toml_format` deliberately leaves to the caller.
//!
//! Spawns `sh -c <command>`, reads stdout/stderr on their own tasks so a
//! full pipe never blocks `wait()`, and races the child against
//! cancellation.

use std::process::Stdio;
use std::sync::Arc;

use serde_json::json;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use weave_core::{BoxFuture, ExecCtx, TaskBody, TaskError, TaskToml, TaskValue};

/// Build a [`TaskBody`] that runs `task.command` under `sh -c`, capturing
/// stdout (trimmed) as the task's result value. A non-zero exit status is
/// reported as a failure carrying the command's stderr. Cancellation kills
/// the child process rather than waiting for it to exit on its own.
pub fn command_task_body(task: &TaskToml) -> Arc<dyn TaskBody> {
    let command = task.command.clone();
    Arc::new(
        move |_input: TaskValue, ctx: ExecCtx| -> BoxFuture<'static, Result<TaskValue, TaskError>> {
            Box::pin(run_command(command.clone(), ctx))
        },
    )
}

async fn run_command(command: String, ctx: ExecCtx) -> Result<TaskValue, TaskError> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| TaskError::new(format!("failed to spawn command {command:?}: {e}")))?;

    let mut stdout = child.stdout.take().expect("stdout is piped");
    let mut stderr = child.stderr.take().expect("stderr is piped");
    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = stderr.read_to_end(&mut buf).await;
        buf
    });

    let status = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => {
            let _ = child.start_kill();
            let _ = child.wait().await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(TaskError::with_kind(
                format!("command {command:?} cancelled"),
                "cancelled",
            ));
        }
        status = child.wait() => {
            status.map_err(|e| TaskError::new(format!("command {command:?} failed: {e}")))?
        }
    };

    let stdout_bytes = stdout_task.await.unwrap_or_default();
    let stderr_bytes = stderr_task.await.unwrap_or_default();

    if status.success() {
        Ok(json!(String::from_utf8_lossy(&stdout_bytes).trim().to_string()))
    } else {
        Err(TaskError::new(format!(
            "command {command:?} exited with {status}: {}",
            String::from_utf8_lossy(&stderr_bytes).trim()
        )))
    }
}
