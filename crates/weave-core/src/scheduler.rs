//! Task scheduler: decides, among ready tasks, which to dispatch this tick
//! and in what order.
//!
//! Repeatedly queries ready tasks and spawns up to the available
//! concurrency slots, the same shape as an orchestrator main loop driving
//! a semaphore's permits; this module adds priority/critical-path ordering
//! and named-resource first-fit allocation on top of a plain scalar
//! concurrency limit.

use std::collections::HashSet;

use chrono::Utc;

use crate::resolver;
use crate::resources::{AllocationKey, ResourceManager};
use crate::types::{TaskId, TaskState, WorkflowDefinition, WorkflowInstance};

/// One scheduling decision: dispatch `task_id` now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub task_id: TaskId,
}

/// Run one scheduling pass:
///
/// 1. `completed` = ids of tasks in a terminal "satisfied" state
///    (Completed or Skipped; a Skipped dependency satisfies its dependents
///    the same way a Completed one does, since downstream tasks only need
///    the dependency to be "done", not successful).
/// 2. `candidates` = ready tasks (per [`resolver::ready_tasks`]) that are
///    currently `Pending` and whose `next_retry_time`, if any, has elapsed.
/// 3. `available_slots` = `max_concurrent` minus currently `Running` tasks
///    (`None` means unbounded).
/// 4. Sort candidates by `(on_critical_path desc, priority desc, def order
///    asc)` — the stable tiebreak on definition order keeps scheduling
///    deterministic for equal-priority, equal-criticality tasks.
/// 5. Walk the sorted candidates in order, greedily reserving resources for
///    each one that fits, *without* stopping at the first one that doesn't
///    — a later, smaller candidate may still fit even if an earlier,
///    bigger one didn't, and skipping it would leave slots idle.
///
/// Allocation happens here, inside the pass, rather than being deferred to
/// the caller: checking and reserving must be one atomic step per
/// candidate, since a snapshot check against `ResourceManager` taken
/// before the batch is chosen would go stale the moment an earlier
/// candidate in the very same batch reserves its share.
pub fn schedule(
    def: &WorkflowDefinition,
    instance: &WorkflowInstance,
    resources: &ResourceManager,
    max_concurrent: Option<usize>,
) -> Vec<Dispatch> {
    let completed: HashSet<TaskId> = instance
        .tasks
        .values()
        .filter(|t| matches!(t.state, TaskState::Completed | TaskState::Skipped))
        .map(|t| t.id.clone())
        .collect();

    let now = Utc::now();
    let ready = resolver::ready_tasks(def, &completed);
    let candidates: Vec<TaskId> = ready
        .into_iter()
        .filter(|id| {
            let inst = &instance.tasks[id];
            inst.state == TaskState::Pending
                && inst.next_retry_time.map(|t| t <= now).unwrap_or(true)
        })
        .collect();

    let running = instance
        .tasks
        .values()
        .filter(|t| t.state == TaskState::Running)
        .count();
    let available_slots = match max_concurrent {
        Some(max) => max.saturating_sub(running),
        None => usize::MAX,
    };
    if available_slots == 0 || candidates.is_empty() {
        return Vec::new();
    }

    let critical = resolver::critical_path(def);
    let mut ordered = candidates;
    ordered.sort_by_key(|id| {
        let task = def.task(id).expect("candidate came from def");
        let on_critical = critical.contains(id);
        let priority = task.priority;
        let def_order = def.task_index(id).unwrap_or(usize::MAX);
        // Negate for descending sort on the first two keys, ascending on
        // the last, within Rust's stable, ascending `sort_by_key`.
        (std::cmp::Reverse(on_critical), std::cmp::Reverse(priority), def_order)
    });

    let mut dispatches = Vec::new();
    for id in ordered {
        if dispatches.len() >= available_slots {
            break;
        }
        let task = def.task(&id).expect("candidate came from def");
        let key = AllocationKey {
            workflow_id: def.id.clone(),
            task_id: id.clone(),
            retry_count: instance.tasks[&id].retry_count,
        };
        // Real allocate(), not just can_allocate(): committing here, one
        // candidate at a time, is what keeps this batch's own candidates
        // from over-booking each other (a plain check-only pass would see
        // every candidate against the same pre-batch snapshot).
        if resources.allocate(key, task.resources.clone()) {
            dispatches.push(Dispatch { task_id: id });
        }
    }

    dispatches
}

/// Whether `instance` has any remaining pending/running work reachable
/// given the current `completed`/`failed` sets, used by the engine to tell
/// "nothing left to schedule because everything is done" apart from
/// "nothing left to schedule because everything is blocked or starved".
pub fn has_unscheduled_work(instance: &WorkflowInstance) -> bool {
    instance
        .tasks
        .values()
        .any(|t| matches!(t.state, TaskState::Pending | TaskState::Running))
}
