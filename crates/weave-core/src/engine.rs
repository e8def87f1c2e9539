//! Workflow Engine: owns the coordinator loop that drives a single workflow
//! run from `workflow_started` to a terminal event.
//!
//! The coordinator loop polls ready tasks, spawns up to the concurrency
//! limit, awaits the next completion, and repeats, applying a state
//! transition table to decide what each outcome means for the task and the
//! workflow as a whole, over an arbitrary in-memory [`WorkflowDefinition`].

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::builders::WorkflowDefinitionBuilder;
use crate::error::EngineError;
use crate::events::{Event, EventBus, Subscriber, SubscriptionId};
use crate::executor::{self, AttemptOutcome, RetryDecision};
use crate::resolver;
use crate::resources::{AllocationKey, Cap, ResourceManager};
use crate::scheduler::{self, Dispatch};
use crate::types::{
    TaskId, TaskInstance, TaskState, TaskValue, WorkflowDefinition, WorkflowId, WorkflowInstance,
    WorkflowState,
};

/// Options governing a single `execute` call, layered over whatever
/// `def.concurrency_limit` / `def.fail_fast` / `def.initial_results` already
/// specify.
#[derive(Default, Clone)]
pub struct ExecuteOptions {
    /// Overrides `def.concurrency_limit` for this run, if set
    /// (`globalConcurrencyLimit`).
    pub max_concurrent: Option<usize>,
    /// An externally-owned cancellation handle. If set, the workflow's own
    /// cancel token is derived as a child of this one, so cancelling it
    /// cancels the workflow; `Engine::cancel` still works independently,
    /// cancelling only the derived child.
    pub cancel_token: Option<CancellationToken>,
    /// Additional seed results layered on top of `def.initial_results`
    /// (this field's entries win on conflict), for resuming a workflow
    /// after externally-sourced out-of-core work without rebuilding `def`.
    pub initial_results: HashMap<TaskId, TaskValue>,
    /// An opaque, user-supplied bag threaded through unmodified to every
    /// task's [`crate::types::ExecCtx::context`].
    pub context: Option<Arc<dyn Any + Send + Sync>>,
}

/// The final, terminal result of a workflow run.
pub struct WorkflowResult {
    pub workflow_id: WorkflowId,
    pub state: WorkflowState,
    pub results: HashMap<TaskId, crate::types::TaskValue>,
    pub tasks: HashMap<TaskId, TaskInstance>,
    /// Errors of every task that ended in `Failed`, keyed by task id.
    pub errors: HashMap<TaskId, EngineError>,
    pub start_time: chrono::DateTime<Utc>,
    pub end_time: chrono::DateTime<Utc>,
    pub duration_ms: u64,
}

/// A point-in-time snapshot of a workflow currently registered as active.
/// A workflow is only ever registered while `Running` (it is deregistered
/// in the same step that assigns its terminal state), so `state` here is
/// always `Running`; the field is still carried explicitly so callers
/// don't have to assume that invariant.
#[derive(Debug, Clone)]
pub struct ActiveWorkflowSnapshot {
    pub workflow_id: WorkflowId,
    pub state: WorkflowState,
    pub start_time: chrono::DateTime<Utc>,
}

struct ActiveEntry {
    cancel_token: tokio_util::sync::CancellationToken,
    start_time: chrono::DateTime<Utc>,
}

/// Coordinates execution of workflows against a shared resource pool.
///
/// One `Engine` can run multiple workflows concurrently, sharing a single
/// `ResourceManager` across all of them on a first-come-first-served basis;
/// it rejects a second concurrent `execute` call for a workflow id already
/// active.
pub struct Engine {
    resources: Arc<ResourceManager>,
    events: Arc<EventBus>,
    active: Mutex<HashMap<WorkflowId, ActiveEntry>>,
}

impl Engine {
    pub fn new(resources: Arc<ResourceManager>) -> Self {
        Self {
            resources,
            events: Arc::new(EventBus::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_resource_totals(totals: HashMap<String, Cap>) -> Self {
        Self::new(Arc::new(ResourceManager::new(totals)))
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> SubscriptionId {
        self.events.subscribe(subscriber)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.events.unsubscribe(id)
    }

    pub fn utilization(&self) -> HashMap<String, f64> {
        self.resources.utilization()
    }

    pub fn update_resource_total(&self, name: impl Into<String>, cap: Cap) {
        self.resources.update_total(name, cap)
    }

    pub fn active_workflow_ids(&self) -> Vec<WorkflowId> {
        self.active.lock().unwrap().keys().cloned().collect()
    }

    /// Snapshots of every workflow currently registered as active, per
    /// `engine.active()`.
    pub fn active(&self) -> Vec<ActiveWorkflowSnapshot> {
        self.active
            .lock()
            .unwrap()
            .iter()
            .map(|(id, entry)| ActiveWorkflowSnapshot {
                workflow_id: id.clone(),
                state: WorkflowState::Running,
                start_time: entry.start_time,
            })
            .collect()
    }

    /// Request cancellation of a running workflow. A no-op if the workflow
    /// is not currently active; calling this twice for the same workflow
    /// has the same effect as calling it once, since `CancellationToken`'s
    /// own `cancel()` is idempotent.
    pub fn cancel(&self, workflow_id: &str) {
        if let Some(entry) = self.active.lock().unwrap().get(workflow_id) {
            entry.cancel_token.cancel();
        }
    }

    /// Run `def` to completion: validate, build the instance, register it
    /// as active (rejecting a duplicate-active run), emit `workflow_started`,
    /// loop scheduling and awaiting task attempts until nothing schedulable
    /// remains, determine the terminal state, emit the terminal event, and
    /// deregister.
    pub async fn execute(
        &self,
        def: &WorkflowDefinition,
        opts: ExecuteOptions,
    ) -> Result<WorkflowResult, EngineError> {
        resolver::validate(def)?;

        let start_time = Utc::now();
        {
            let mut active = self.active.lock().unwrap();
            if active.contains_key(&def.id) {
                return Err(EngineError::WorkflowAlreadyActiveError {
                    workflow_id: def.id.clone(),
                });
            }
            // A fresh cancel token linked to opts.cancel_token: a child
            // token fires when the caller's own handle cancels, while
            // `Engine::cancel` can still cancel just this run via the
            // child independently.
            let cancel_token = match &opts.cancel_token {
                Some(parent) => parent.child_token(),
                None => tokio_util::sync::CancellationToken::new(),
            };
            active.insert(
                def.id.clone(),
                ActiveEntry {
                    cancel_token,
                    start_time,
                },
            );
        }

        let mut instance = WorkflowInstance::new(def);
        instance.cancel_token = self
            .active
            .lock()
            .unwrap()
            .get(&def.id)
            .expect("just inserted")
            .cancel_token
            .clone();
        instance.state = WorkflowState::Running;
        instance.start_time = Some(start_time);
        for (id, value) in &opts.initial_results {
            instance.results.insert(id.clone(), value.clone());
        }

        self.events.emit(Event::WorkflowStarted {
            workflow_id: def.id.clone(),
            at: instance.start_time.unwrap(),
        });

        let max_concurrent = opts.max_concurrent.or(def.concurrency_limit);
        let result = self.run_loop(def, &mut instance, max_concurrent, opts.context.clone()).await;

        instance.end_time = Some(Utc::now());
        self.active.lock().unwrap().remove(&def.id);

        let final_state = result.unwrap_or(WorkflowState::Failed);
        instance.state = final_state;

        match final_state {
            WorkflowState::Completed => {
                self.events.emit(Event::WorkflowCompleted {
                    workflow_id: def.id.clone(),
                    at: instance.end_time.unwrap(),
                });
            }
            WorkflowState::Cancelled => {
                self.events.emit(Event::WorkflowCancelled {
                    workflow_id: def.id.clone(),
                    at: instance.end_time.unwrap(),
                    reason: "cancelled".to_string(),
                });
            }
            WorkflowState::Failed => {
                let error = instance
                    .tasks
                    .values()
                    .find_map(|t| t.error.clone())
                    .unwrap_or_else(|| EngineError::BuilderError("workflow failed".into()));
                self.events.emit(Event::WorkflowFailed {
                    workflow_id: def.id.clone(),
                    at: instance.end_time.unwrap(),
                    error,
                });
            }
            WorkflowState::Pending | WorkflowState::Running => unreachable!("not a terminal state"),
        }

        let errors: HashMap<TaskId, EngineError> = instance
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Failed)
            .filter_map(|t| t.error.clone().map(|e| (t.id.clone(), e)))
            .collect();
        let end_time = instance.end_time.unwrap();
        let duration_ms = (end_time - start_time).num_milliseconds().max(0) as u64;

        Ok(WorkflowResult {
            workflow_id: def.id.clone(),
            state: instance.state,
            results: instance.results,
            tasks: instance.tasks,
            errors,
            start_time,
            end_time,
            duration_ms,
        })
    }

    /// The main coordinator loop: schedule ready tasks, spawn attempts,
    /// await the next completion, repeat until nothing remains to do.
    async fn run_loop(
        &self,
        def: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        max_concurrent: Option<usize>,
        context: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<WorkflowState, EngineError> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<TaskOutcomeMsg>();
        let mut in_flight = 0usize;
        let mut hard_failed = false;
        let mut fail_fast_triggered = false;

        loop {
            if instance.cancel_token.is_cancelled() && in_flight == 0 {
                return Ok(if fail_fast_triggered {
                    WorkflowState::Failed
                } else {
                    WorkflowState::Cancelled
                });
            }

            if !instance.cancel_token.is_cancelled() {
                if hard_failed && def.fail_fast {
                    fail_fast_triggered = true;
                    instance.cancel_token.cancel();
                } else {
                    self.apply_skips(def, instance);

                    let dispatches =
                        scheduler::schedule(def, instance, &self.resources, max_concurrent);
                    for Dispatch { task_id } in dispatches {
                        self.spawn_attempt(def, instance, task_id, tx.clone(), context.clone());
                        in_flight += 1;
                    }
                }
            }

            if in_flight == 0 {
                if instance.all_tasks_terminal() {
                    return Ok(if hard_failed {
                        WorkflowState::Failed
                    } else {
                        WorkflowState::Completed
                    });
                }
                if instance.cancel_token.is_cancelled() {
                    // Cancellation requested, nothing in flight, and not
                    // every task has reached a terminal state yet: the
                    // remaining pending tasks never got to run at all.
                    self.cancel_remaining(def, instance);
                    continue;
                }
                debug_assert!(
                    scheduler::has_unscheduled_work(instance),
                    "no pending/running task but not all_tasks_terminal: Pending/Running and \
                     terminal states partition TaskState, so this cannot happen"
                );
                // Pending work exists but nothing was dispatched and
                // nothing is running: either a ready task permanently
                // exceeds a resource cap (starvation), or every pending
                // task is merely waiting out a retry backoff delay.
                // Distinguish the two so a starved workflow fails instead
                // of hanging on `rx.recv()` forever with nothing left to
                // ever wake it.
                if let Some((task_id, resource, need, cap)) = self.find_starved_task(def, instance) {
                    self.fail_task(
                        def,
                        instance,
                        &task_id,
                        EngineError::ResourceStarvationError {
                            workflow_id: def.id.clone(),
                            task_id: task_id.clone(),
                            resource,
                            need,
                            cap,
                        },
                        &mut hard_failed,
                        Utc::now(),
                    );
                    continue;
                }
                match self.next_retry_deadline(instance) {
                    Some(deadline) => {
                        let std_deadline = tokio::time::Instant::now()
                            + (deadline - Utc::now())
                                .to_std()
                                .unwrap_or(Duration::from_millis(0));
                        tokio::select! {
                            _ = tokio::time::sleep_until(std_deadline) => {}
                            _ = instance.cancel_token.cancelled() => {}
                        }
                        continue;
                    }
                    None => return Ok(WorkflowState::Failed),
                }
            }

            let Some(msg) = rx.recv().await else {
                return Ok(if hard_failed {
                    WorkflowState::Failed
                } else {
                    WorkflowState::Completed
                });
            };
            in_flight -= 1;
            self.apply_outcome(def, instance, msg, &mut hard_failed);
        }
    }

    /// The earliest `next_retry_time` among currently `Pending` tasks, if
    /// any task is waiting one out.
    fn next_retry_deadline(&self, instance: &WorkflowInstance) -> Option<chrono::DateTime<Utc>> {
        instance
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .filter_map(|t| t.next_retry_time)
            .min()
    }

    /// The first currently-ready `Pending` task whose resource requirements
    /// permanently exceed a bounded cap, if any.
    fn find_starved_task(
        &self,
        def: &WorkflowDefinition,
        instance: &WorkflowInstance,
    ) -> Option<(TaskId, String, f64, f64)> {
        let completed: std::collections::HashSet<TaskId> = instance
            .tasks
            .values()
            .filter(|t| matches!(t.state, TaskState::Completed | TaskState::Skipped))
            .map(|t| t.id.clone())
            .collect();
        for task_id in resolver::ready_tasks(def, &completed) {
            let inst = &instance.tasks[&task_id];
            if inst.state != TaskState::Pending || inst.next_retry_time.is_some() {
                continue;
            }
            let task = def.task(&task_id).expect("ready task exists in def");
            if let Some((resource, need, cap)) = self.resources.exceeds_cap(&task.resources) {
                return Some((task_id, resource, need, cap));
            }
        }
        None
    }

    /// Mark every still-`Pending` task as `Cancelled` once the workflow has
    /// wound down with nothing in flight.
    fn cancel_remaining(&self, def: &WorkflowDefinition, instance: &mut WorkflowInstance) {
        let now = Utc::now();
        let pending_ids: Vec<TaskId> = instance.ids_in_state(TaskState::Pending);
        for task_id in pending_ids {
            let inst = instance.tasks.get_mut(&task_id).unwrap();
            inst.state = TaskState::Cancelled;
            inst.end_time = Some(now);
            inst.error = Some(EngineError::CancelledError {
                task_id: task_id.clone(),
            });
            self.events.emit(Event::TaskCancelled {
                workflow_id: def.id.clone(),
                task_id,
                at: now,
                duration_ms: 0,
            });
        }
    }

    /// Mark any task whose dependencies can never all complete (because at
    /// least one has terminally failed or been cancelled without a
    /// `ContinueWorkflow` failure mode being tolerated downstream) as
    /// `Skipped`, `FailureMode::ContinueWorkflow`
    /// semantics: downstream tasks of a tolerated failure are skipped, not
    /// run with a missing dependency.
    fn apply_skips(&self, def: &WorkflowDefinition, instance: &mut WorkflowInstance) {
        loop {
            let mut newly_skipped = Vec::new();
            for task in &def.tasks {
                let inst = &instance.tasks[&task.id];
                if inst.state != TaskState::Pending {
                    continue;
                }
                let blocked = task.dependencies.iter().any(|dep| {
                    let dep_inst = &instance.tasks[dep];
                    matches!(dep_inst.state, TaskState::Failed | TaskState::Cancelled | TaskState::Skipped)
                });
                if blocked {
                    newly_skipped.push(task.id.clone());
                }
            }
            if newly_skipped.is_empty() {
                return;
            }
            for id in newly_skipped {
                let inst = instance.tasks.get_mut(&id).unwrap();
                inst.state = TaskState::Skipped;
                inst.end_time = Some(Utc::now());
                self.events.emit(Event::TaskSkipped {
                    workflow_id: def.id.clone(),
                    task_id: id,
                    at: inst.end_time.unwrap(),
                    reason: "upstream dependency did not complete".to_string(),
                });
            }
        }
    }

    fn spawn_attempt(
        &self,
        def: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        task_id: TaskId,
        tx: tokio::sync::mpsc::UnboundedSender<TaskOutcomeMsg>,
        context: Option<Arc<dyn Any + Send + Sync>>,
    ) {
        let task = def.task(&task_id).expect("dispatched task exists").clone();
        let inst = instance.tasks.get_mut(&task_id).unwrap();
        inst.state = TaskState::Running;
        inst.start_time = Some(Utc::now());

        // The scheduler already committed this attempt's allocation (it
        // must, to keep candidates within one batch from over-booking each
        // other — see scheduler::schedule); this key only exists so
        // `release` can find and undo that same grant once the attempt
        // finishes.
        let key = AllocationKey {
            workflow_id: def.id.clone(),
            task_id: task_id.clone(),
            retry_count: inst.retry_count,
        };

        let results_view = instance.results_view();
        let input = task.input.resolve(&results_view);

        let workflow_cancel = instance.cancel_token.clone();
        let events = self.events.clone();
        let resources = self.resources.clone();
        let workflow_id = def.id.clone();
        let attempt = inst.retry_count + 1;

        events.emit(Event::TaskStarted {
            workflow_id: workflow_id.clone(),
            task_id: task_id.clone(),
            at: inst.start_time.unwrap(),
            attempt,
        });

        tokio::spawn(async move {
            let outcome = match input {
                Ok(value) => {
                    executor::execute_attempt_with_context(
                        &task,
                        &task_id,
                        value,
                        &workflow_cancel,
                        context,
                    )
                    .await
                }
                Err(message) => AttemptOutcome::Failed(EngineError::InputResolutionError {
                    task_id: task_id.clone(),
                    message,
                }),
            };
            resources.release(&key);
            let _ = tx.send(TaskOutcomeMsg {
                task_id,
                workflow_id,
                outcome,
            });
        });
    }

    fn apply_outcome(
        &self,
        def: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        msg: TaskOutcomeMsg,
        hard_failed: &mut bool,
    ) {
        let TaskOutcomeMsg { task_id, workflow_id, outcome } = msg;
        let task = def.task(&task_id).expect("outcome for known task");
        let now = Utc::now();

        let timeout_ms = task.timeout.map(|d| d.as_millis() as u64).unwrap_or(0);
        let decision = decide_retry_for(
            &outcome,
            instance.tasks[&task_id].retry_count,
            task.retry_policy.as_ref(),
            &task_id,
            timeout_ms,
        );

        match (&outcome, decision) {
            (AttemptOutcome::Completed(value), _) => {
                instance.results.insert(task_id.clone(), value.clone());
                let inst = instance.tasks.get_mut(&task_id).unwrap();
                inst.state = TaskState::Completed;
                inst.end_time = Some(now);
                self.events.emit(Event::TaskCompleted {
                    workflow_id,
                    task_id,
                    at: now,
                    result: value.clone(),
                });
            }
            (_, RetryDecision::Retry { delay }) => {
                let error = match &outcome {
                    AttemptOutcome::Failed(e) => e.clone(),
                    AttemptOutcome::TimedOut => EngineError::TaskTimeoutError {
                        task_id: task_id.clone(),
                        timeout_ms,
                    },
                    AttemptOutcome::Completed(_) | AttemptOutcome::Cancelled => {
                        unreachable!("decide_retry never retries a completed or cancelled attempt")
                    }
                };
                let next_retry_time = now + chrono::Duration::from_std(delay).unwrap_or_default();
                let inst = instance.tasks.get_mut(&task_id).unwrap();
                inst.retry_count += 1;
                inst.state = TaskState::Pending;
                inst.next_retry_time = Some(next_retry_time);
                self.events.emit(Event::TaskRetrying {
                    workflow_id,
                    task_id,
                    at: now,
                    retry_count: inst.retry_count,
                    next_retry_time,
                    error,
                });
            }
            (AttemptOutcome::Cancelled, RetryDecision::Final) => {
                let inst = instance.tasks.get_mut(&task_id).unwrap();
                inst.state = TaskState::Cancelled;
                inst.end_time = Some(now);
                inst.error = Some(EngineError::CancelledError { task_id: task_id.clone() });
                let duration_ms = (now - inst.start_time.unwrap_or(now)).num_milliseconds().max(0) as u64;
                self.events.emit(Event::TaskCancelled {
                    workflow_id,
                    task_id,
                    at: now,
                    duration_ms,
                });
            }
            (AttemptOutcome::TimedOut, RetryDecision::Final) => {
                let timeout_ms = task.timeout.map(|d| d.as_millis() as u64).unwrap_or(0);
                let error = EngineError::TaskTimeoutError {
                    task_id: task_id.clone(),
                    timeout_ms,
                };
                self.fail_task(def, instance, &task_id, error, hard_failed, now);
            }
            (AttemptOutcome::Failed(error), RetryDecision::Final) => {
                let error = error.clone();
                self.events.emit(Event::TaskFailed {
                    workflow_id: workflow_id.clone(),
                    task_id: task_id.clone(),
                    at: now,
                    attempt: instance.tasks[&task_id].retry_count + 1,
                    error: error.clone(),
                    will_retry: false,
                });
                self.fail_task(def, instance, &task_id, error, hard_failed, now);
            }
        }
    }

    fn fail_task(
        &self,
        def: &WorkflowDefinition,
        instance: &mut WorkflowInstance,
        task_id: &TaskId,
        error: EngineError,
        hard_failed: &mut bool,
        now: chrono::DateTime<Utc>,
    ) {
        let inst = instance.tasks.get_mut(task_id).unwrap();
        inst.state = TaskState::Failed;
        inst.end_time = Some(now);
        inst.error = Some(error);

        let task = def.task(task_id).expect("known task");
        if task.failure_mode == crate::types::FailureMode::FailWorkflow {
            *hard_failed = true;
        }
    }
}

fn decide_retry_for(
    outcome: &AttemptOutcome,
    retry_count: u32,
    policy: Option<&crate::types::RetryPolicy>,
    task_id: &TaskId,
    timeout_ms: u64,
) -> RetryDecision {
    executor::decide_retry(outcome, retry_count, policy, task_id, timeout_ms)
}

struct TaskOutcomeMsg {
    task_id: TaskId,
    workflow_id: WorkflowId,
    outcome: AttemptOutcome,
}

/// Convenience for building a single-task or small ad-hoc workflow without
/// going through the full builder.
pub fn single_task_workflow(
    workflow_id: impl Into<WorkflowId>,
    task: crate::types::TaskDefinition,
) -> Result<WorkflowDefinition, EngineError> {
    WorkflowDefinitionBuilder::new(workflow_id, "ad-hoc")
        .task(task)
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::{TaskDefinitionBuilder, WorkflowDefinitionBuilder};
    use crate::types::Priority;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn immediate_task(id: &str, deps: &[&str]) -> crate::types::TaskDefinition {
        TaskDefinitionBuilder::new(id, id)
            .dependencies(deps.iter().map(|s| s.to_string()).collect())
            .body_fn(|input, _ctx| Box::pin(async move { Ok(input) }))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn linear_chain_completes() {
        let def = WorkflowDefinitionBuilder::new("wf", "wf")
            .tasks(vec![
                immediate_task("a", &[]),
                immediate_task("b", &["a"]),
                immediate_task("c", &["b"]),
            ])
            .build()
            .unwrap();

        let engine = Engine::with_resource_totals(HashMap::new());
        let result = engine.execute(&def, ExecuteOptions::default()).await.unwrap();
        assert_eq!(result.state, WorkflowState::Completed);
        assert_eq!(result.tasks["a"].state, TaskState::Completed);
        assert_eq!(result.tasks["c"].state, TaskState::Completed);
    }

    #[tokio::test]
    async fn diamond_dependency_runs_parallel_branches() {
        let def = WorkflowDefinitionBuilder::new("wf", "wf")
            .tasks(vec![
                immediate_task("a", &[]),
                immediate_task("b", &["a"]),
                immediate_task("c", &["a"]),
                immediate_task("d", &["b", "c"]),
            ])
            .build()
            .unwrap();

        let engine = Engine::with_resource_totals(HashMap::new());
        let result = engine.execute(&def, ExecuteOptions::default()).await.unwrap();
        assert_eq!(result.state, WorkflowState::Completed);
        assert_eq!(result.tasks["d"].state, TaskState::Completed);
    }

    #[tokio::test]
    async fn failing_task_fails_workflow_by_default() {
        let failing = TaskDefinitionBuilder::new("fail", "fail")
            .body_fn(|_input, _ctx| {
                Box::pin(async { Err(crate::error::TaskError::new("boom")) })
            })
            .build()
            .unwrap();
        let downstream = immediate_task("after", &["fail"]);
        let def = WorkflowDefinitionBuilder::new("wf", "wf")
            .tasks(vec![failing, downstream])
            .build()
            .unwrap();

        let engine = Engine::with_resource_totals(HashMap::new());
        let result = engine.execute(&def, ExecuteOptions::default()).await.unwrap();
        assert_eq!(result.state, WorkflowState::Failed);
        assert_eq!(result.tasks["fail"].state, TaskState::Failed);
        assert_eq!(result.tasks["after"].state, TaskState::Skipped);
    }

    #[tokio::test]
    async fn fail_fast_cancels_sibling_and_workflow_ends_failed() {
        let failing = TaskDefinitionBuilder::new("fail", "fail")
            .body_fn(|_input, _ctx| {
                Box::pin(async { Err(crate::error::TaskError::new("boom")) })
            })
            .build()
            .unwrap();
        let sibling = TaskDefinitionBuilder::new("sibling", "sibling")
            .body_fn(|_input, ctx| {
                Box::pin(async move {
                    loop {
                        if ctx.is_cancelled() {
                            return Err(crate::error::TaskError::new("cancelled"));
                        }
                        tokio::time::sleep(Duration::from_millis(5)).await;
                    }
                })
            })
            .build()
            .unwrap();
        let def = WorkflowDefinitionBuilder::new("wf", "wf")
            .fail_fast(true)
            .tasks(vec![failing, sibling])
            .build()
            .unwrap();

        let engine = Engine::with_resource_totals(HashMap::new());
        let result = engine.execute(&def, ExecuteOptions::default()).await.unwrap();
        // The still-running sibling is torn down by the fail_fast cancel,
        // but the workflow as a whole reports Failed, not Cancelled: only
        // the user calling `Engine::cancel` (or an external cancel token)
        // should ever produce Cancelled.
        assert_eq!(result.state, WorkflowState::Failed);
        assert_eq!(result.tasks["fail"].state, TaskState::Failed);
        assert_eq!(result.tasks["sibling"].state, TaskState::Cancelled);
    }

    #[tokio::test]
    async fn continue_workflow_failure_mode_skips_only_downstream() {
        let failing = TaskDefinitionBuilder::new("fail", "fail")
            .failure_mode(crate::types::FailureMode::ContinueWorkflow)
            .body_fn(|_input, _ctx| {
                Box::pin(async { Err(crate::error::TaskError::new("boom")) })
            })
            .build()
            .unwrap();
        let independent = immediate_task("independent", &[]);
        let def = WorkflowDefinitionBuilder::new("wf", "wf")
            .tasks(vec![failing, independent])
            .build()
            .unwrap();

        let engine = Engine::with_resource_totals(HashMap::new());
        let result = engine.execute(&def, ExecuteOptions::default()).await.unwrap();
        assert_eq!(result.state, WorkflowState::Completed);
        assert_eq!(result.tasks["independent"].state, TaskState::Completed);
    }

    #[tokio::test]
    async fn retry_then_succeed() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts_clone = attempts.clone();
        let task = TaskDefinitionBuilder::new("flaky", "flaky")
            .retry_policy(crate::types::RetryPolicy {
                max_retries: 3,
                initial_delay: Duration::from_millis(1),
                backoff_factor: 1.0,
                max_delay: Duration::from_millis(5),
                retryable_errors: None,
            })
            .body_fn(move |_input, _ctx| {
                let attempts = attempts_clone.clone();
                Box::pin(async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n < 2 {
                        Err(crate::error::TaskError::new("transient"))
                    } else {
                        Ok(json!("ok"))
                    }
                })
            })
            .build()
            .unwrap();
        let def = WorkflowDefinitionBuilder::new("wf", "wf").task(task).build().unwrap();

        let engine = Engine::with_resource_totals(HashMap::new());
        let result = engine.execute(&def, ExecuteOptions::default()).await.unwrap();
        assert_eq!(result.state, WorkflowState::Completed);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn duplicate_active_run_rejected() {
        let task = TaskDefinitionBuilder::new("slow", "slow")
            .body_fn(|_input, _ctx| {
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!(null))
                })
            })
            .build()
            .unwrap();
        let def = Arc::new(
            WorkflowDefinitionBuilder::new("wf", "wf")
                .task(task)
                .build()
                .unwrap(),
        );
        let engine = Arc::new(Engine::with_resource_totals(HashMap::new()));

        let engine_clone = engine.clone();
        let def_clone = def.clone();
        let handle = tokio::spawn(async move { engine_clone.execute(&def_clone, ExecuteOptions::default()).await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = engine.execute(&def, ExecuteOptions::default()).await;
        assert!(matches!(second, Err(EngineError::WorkflowAlreadyActiveError { .. })));

        let first = handle.await.unwrap();
        assert!(first.is_ok());
    }

    #[tokio::test]
    async fn priority_does_not_block_engine_from_completing() {
        let def = WorkflowDefinitionBuilder::new("wf", "wf")
            .tasks(vec![
                TaskDefinitionBuilder::new("low", "low")
                    .priority(Priority::Low)
                    .body_fn(|_input, _ctx| Box::pin(async { Ok(json!(1)) }))
                    .build()
                    .unwrap(),
                TaskDefinitionBuilder::new("high", "high")
                    .priority(Priority::High)
                    .body_fn(|_input, _ctx| Box::pin(async { Ok(json!(2)) }))
                    .build()
                    .unwrap(),
            ])
            .build()
            .unwrap();
        let engine = Engine::with_resource_totals(HashMap::new());
        let result = engine.execute(&def, ExecuteOptions::default()).await.unwrap();
        assert_eq!(result.state, WorkflowState::Completed);
    }

    #[tokio::test]
    async fn cancellation_emits_task_cancelled_not_task_skipped() {
        let def = Arc::new(
            WorkflowDefinitionBuilder::new("wf", "wf")
                .task(
                    TaskDefinitionBuilder::new("slow", "slow")
                        .body_fn(|_input, ctx| {
                            Box::pin(async move {
                                loop {
                                    if ctx.is_cancelled() {
                                        return Err(crate::error::TaskError::new("cancelled"));
                                    }
                                    tokio::time::sleep(Duration::from_millis(5)).await;
                                }
                            })
                        })
                        .build()
                        .unwrap(),
                )
                .build()
                .unwrap(),
        );
        let engine = Arc::new(Engine::with_resource_totals(HashMap::new()));

        let events: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        engine.subscribe(Arc::new(move |e: &Event| {
            events_clone.lock().unwrap().push(e.name());
        }));

        let engine_clone = engine.clone();
        let def_clone = def.clone();
        let handle = tokio::spawn(async move { engine_clone.execute(&def_clone, ExecuteOptions::default()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(engine.active().len(), 1);
        engine.cancel("wf");
        engine.cancel("wf"); // idempotent: a second call changes nothing

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.state, WorkflowState::Cancelled);
        assert_eq!(result.tasks["slow"].state, TaskState::Cancelled);
        assert!(events.lock().unwrap().contains(&"task_cancelled"));
        assert!(!events.lock().unwrap().contains(&"task_skipped"));
        assert!(engine.active().is_empty());
    }

    #[tokio::test]
    async fn external_cancel_token_cancels_workflow() {
        let def = Arc::new(
            WorkflowDefinitionBuilder::new("wf", "wf")
                .task(
                    TaskDefinitionBuilder::new("slow", "slow")
                        .body_fn(|_input, ctx| {
                            Box::pin(async move {
                                loop {
                                    if ctx.is_cancelled() {
                                        return Err(crate::error::TaskError::new("cancelled"));
                                    }
                                    tokio::time::sleep(Duration::from_millis(5)).await;
                                }
                            })
                        })
                        .build()
                        .unwrap(),
                )
                .build()
                .unwrap(),
        );
        let engine = Arc::new(Engine::with_resource_totals(HashMap::new()));
        let external = CancellationToken::new();

        let engine_clone = engine.clone();
        let def_clone = def.clone();
        let external_clone = external.clone();
        let handle = tokio::spawn(async move {
            let opts = ExecuteOptions {
                cancel_token: Some(external_clone),
                ..Default::default()
            };
            engine_clone.execute(&def_clone, opts).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        external.cancel();

        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.state, WorkflowState::Cancelled);
    }

    #[tokio::test]
    async fn initial_results_seed_is_visible_to_derived_input() {
        // "seed" is never produced by any task in this workflow; it only
        // exists because `ExecuteOptions.initial_results` pre-populates the
        // results table before the first task is scheduled.
        let reads_seed = TaskDefinitionBuilder::new("reader", "reader")
            .derived_input(|results| {
                results
                    .get("seed")
                    .cloned()
                    .ok_or_else(|| "missing seed".to_string())
            })
            .body_fn(|input, _ctx| Box::pin(async move { Ok(input) }))
            .build()
            .unwrap();
        let def = WorkflowDefinitionBuilder::new("wf", "wf").task(reads_seed).build().unwrap();

        let mut initial_results = HashMap::new();
        initial_results.insert("seed".to_string(), json!("seeded"));

        let engine = Engine::with_resource_totals(HashMap::new());
        let opts = ExecuteOptions {
            initial_results,
            ..Default::default()
        };
        let result = engine.execute(&def, opts).await.unwrap();
        assert_eq!(result.state, WorkflowState::Completed);
        assert_eq!(result.results["reader"], json!("seeded"));
    }

    #[tokio::test]
    async fn context_bag_is_visible_inside_task_body() {
        #[derive(Debug, PartialEq)]
        struct Marker(u32);

        let observed: Arc<Mutex<Option<u32>>> = Arc::new(Mutex::new(None));
        let observed_clone = observed.clone();
        let task = TaskDefinitionBuilder::new("reads_context", "reads_context")
            .body_fn(move |_input, ctx| {
                let observed = observed_clone.clone();
                Box::pin(async move {
                    if let Some(ctx_bag) = ctx.context.as_ref().and_then(|c| c.downcast_ref::<Marker>()) {
                        *observed.lock().unwrap() = Some(ctx_bag.0);
                    }
                    Ok(json!(null))
                })
            })
            .build()
            .unwrap();
        let def = WorkflowDefinitionBuilder::new("wf", "wf").task(task).build().unwrap();

        let engine = Engine::with_resource_totals(HashMap::new());
        let opts = ExecuteOptions {
            context: Some(Arc::new(Marker(42))),
            ..Default::default()
        };
        let result = engine.execute(&def, opts).await.unwrap();
        assert_eq!(result.state, WorkflowState::Completed);
        assert_eq!(*observed.lock().unwrap(), Some(42));
    }
}
