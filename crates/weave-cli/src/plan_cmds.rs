//! `weave plan validate` / `weave plan run`.
//!
//! Both parse a TOML workflow file into a [`WorkflowDefinition`]; there is
//! nothing to persist, so `validate` and `run` diverge only in whether the
//! result is executed.

use std::collections::HashMap;

use anyhow::{Context, Result};
use weave_core::{Engine, ExecuteOptions, TaskState, WorkflowState};

use crate::config::WeaveConfig;
use crate::shell_task;

/// Parse and validate a workflow TOML file without running it. Prints a
/// summary of the task graph on success.
pub fn run_validate(file: &str) -> Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read workflow file {file:?}"))?;
    let parsed = weave_core::parse_workflow_toml(&contents)?;
    let def = parsed
        .build(shell_task::command_task_body)
        .with_context(|| format!("workflow {file:?} failed validation"))?;

    println!("workflow {:?} is valid: {} task(s)", def.id, def.tasks.len());
    for task in &def.tasks {
        let deps = if task.dependencies.is_empty() {
            "(none)".to_string()
        } else {
            task.dependencies.join(", ")
        };
        println!("  - {} [priority={}] depends_on: {}", task.id, task.priority, deps);
    }
    Ok(())
}

/// Parse a workflow TOML file, build an engine from the resolved
/// configuration, execute it to completion, and report the result.
pub async fn run_plan(
    file: &str,
    cli_resources: &[String],
    cli_max_concurrency: Option<usize>,
) -> Result<()> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read workflow file {file:?}"))?;
    let parsed = weave_core::parse_workflow_toml(&contents)?;
    let def = parsed
        .build(shell_task::command_task_body)
        .with_context(|| format!("workflow {file:?} failed validation"))?;

    let config = WeaveConfig::resolve(cli_resources, cli_max_concurrency)
        .context("failed to resolve engine configuration")?;

    let engine = Engine::with_resource_totals(config.resource_totals);
    engine.subscribe(std::sync::Arc::new(crate::printing_subscriber));

    let opts = ExecuteOptions {
        max_concurrent: config.default_concurrency,
    };
    let result = engine
        .execute(&def, opts)
        .await
        .with_context(|| format!("workflow {:?} could not start", def.id))?;

    print_summary(&result.workflow_id, result.state, &result.tasks, &result.results);

    if result.state != WorkflowState::Completed {
        anyhow::bail!("workflow {:?} ended in state {}", result.workflow_id, result.state);
    }
    Ok(())
}

fn print_summary(
    workflow_id: &str,
    state: WorkflowState,
    tasks: &HashMap<String, weave_core::TaskInstance>,
    results: &HashMap<String, weave_core::TaskValue>,
) {
    println!();
    println!("workflow {workflow_id:?}: {state}");
    let mut ids: Vec<&String> = tasks.keys().collect();
    ids.sort();
    for id in ids {
        let inst = &tasks[id];
        match inst.state {
            TaskState::Completed => {
                println!("  {id}: completed -> {}", results.get(id).cloned().unwrap_or_default());
            }
            TaskState::Failed => {
                let message = inst
                    .error
                    .as_ref()
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "unknown error".to_string());
                println!("  {id}: failed ({message})");
            }
            other => println!("  {id}: {other}"),
        }
    }
}
