//! Dependency resolver: DAG validation, topological order, ready sets, and
//! critical path.
//!
//! Cycle detection uses Kahn's algorithm over task ids; a ready task is one
//! that is still pending with every dependency already satisfied. Both are
//! pure functions over an in-memory [`WorkflowDefinition`].

use std::collections::{HashSet, VecDeque};

use crate::error::EngineError;
use crate::types::{TaskId, WorkflowDefinition};

/// Validate that `def` is well-formed: unique task ids, every dependency
/// reference resolves, and the dependency graph is acyclic.
///
/// Pure function; does not mutate `def`.
pub fn validate(def: &WorkflowDefinition) -> Result<(), EngineError> {
    let mut seen = HashSet::new();
    for task in &def.tasks {
        if !seen.insert(task.id.as_str()) {
            return Err(EngineError::DuplicateTaskIdError(task.id.clone()));
        }
    }

    for task in &def.tasks {
        for dep in &task.dependencies {
            if !seen.contains(dep.as_str()) {
                return Err(EngineError::MissingDependencyError {
                    task_id: task.id.clone(),
                    missing_id: dep.clone(),
                });
            }
        }
    }

    detect_cycle(def)?;

    Ok(())
}

/// DFS with an explicit recursion stack. On re-entering a node already on
/// the stack, the path from that node's first occurrence through the
/// current node forms the reported cycle.
fn detect_cycle(def: &WorkflowDefinition) -> Result<(), EngineError> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    let mut marks = vec![Mark::Unvisited; def.tasks.len()];
    let mut stack_path: Vec<usize> = Vec::new();

    fn visit(
        idx: usize,
        def: &WorkflowDefinition,
        marks: &mut Vec<Mark>,
        stack_path: &mut Vec<usize>,
    ) -> Result<(), EngineError> {
        match marks[idx] {
            Mark::Done => return Ok(()),
            Mark::InProgress => {
                let start = stack_path.iter().position(|&i| i == idx).unwrap();
                let cycle: Vec<TaskId> = stack_path[start..]
                    .iter()
                    .map(|&i| def.tasks[i].id.clone())
                    .chain(std::iter::once(def.tasks[idx].id.clone()))
                    .collect();
                return Err(EngineError::CycleError { cycle });
            }
            Mark::Unvisited => {}
        }

        marks[idx] = Mark::InProgress;
        stack_path.push(idx);

        for dep in &def.tasks[idx].dependencies {
            if let Some(dep_idx) = def.task_index(dep) {
                visit(dep_idx, def, marks, stack_path)?;
            }
        }

        stack_path.pop();
        marks[idx] = Mark::Done;
        Ok(())
    }

    for idx in 0..def.tasks.len() {
        visit(idx, def, &mut marks, &mut stack_path)?;
    }

    Ok(())
}

/// Topological order via Kahn's algorithm. Ties are broken by the task's
/// position in `def.tasks` (stable): the ready queue is always scanned in
/// definition order, not insertion order.
pub fn topological_order(def: &WorkflowDefinition) -> Result<Vec<TaskId>, EngineError> {
    validate(def)?;

    let n = def.tasks.len();
    let mut in_degree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (idx, task) in def.tasks.iter().enumerate() {
        for dep in &task.dependencies {
            let dep_idx = def.task_index(dep).expect("validated above");
            dependents[dep_idx].push(idx);
            in_degree[idx] += 1;
        }
    }

    let mut ready: VecDeque<usize> = (0..n).filter(|&i| in_degree[i] == 0).collect();
    let mut order = Vec::with_capacity(n);

    while let Some(idx) = pop_stable(&mut ready) {
        order.push(def.tasks[idx].id.clone());
        for &dep_idx in &dependents[idx] {
            in_degree[dep_idx] -= 1;
            if in_degree[dep_idx] == 0 {
                ready.push_back(dep_idx);
            }
        }
    }

    Ok(order)
}

/// Pop the smallest-index entry from the ready queue to keep tie-breaks
/// stable against `def.tasks` order, regardless of insertion order.
fn pop_stable(ready: &mut VecDeque<usize>) -> Option<usize> {
    if ready.is_empty() {
        return None;
    }
    let (pos, _) = ready.iter().enumerate().min_by_key(|(_, &v)| v)?;
    ready.remove(pos)
}

/// Ids whose every dependency is in `completed`, excluding ids already
/// completed. Preserves `def.tasks` order.
pub fn ready_tasks(def: &WorkflowDefinition, completed: &HashSet<TaskId>) -> Vec<TaskId> {
    def.tasks
        .iter()
        .filter(|t| !completed.contains(&t.id))
        .filter(|t| t.dependencies.iter().all(|d| completed.contains(d)))
        .map(|t| t.id.clone())
        .collect()
}

/// Compute the set of task ids on *a* longest path through the DAG (by hop
/// count). Used only as a priority-boost input by the scheduler; ties are
/// resolved arbitrarily since the exact path chosen does not affect
/// correctness, only which otherwise-equal-priority tasks get a boost.
pub fn critical_path(def: &WorkflowDefinition) -> HashSet<TaskId> {
    let order = match topological_order(def) {
        Ok(o) => o,
        Err(_) => return HashSet::new(),
    };

    // longest_path_ending_at[id] = (length, predecessor)
    let mut longest: std::collections::HashMap<TaskId, usize> = std::collections::HashMap::new();
    let mut predecessor: std::collections::HashMap<TaskId, TaskId> =
        std::collections::HashMap::new();

    for id in &order {
        let task = def.task(id).expect("id came from topological_order");
        let mut best = 0usize;
        let mut best_pred: Option<TaskId> = None;
        for dep in &task.dependencies {
            let dep_len = *longest.get(dep).unwrap_or(&0) + 1;
            if dep_len > best {
                best = dep_len;
                best_pred = Some(dep.clone());
            }
        }
        longest.insert(id.clone(), best);
        if let Some(p) = best_pred {
            predecessor.insert(id.clone(), p);
        }
    }

    let Some((end, _)) = longest.iter().max_by_key(|(_, &len)| len) else {
        return HashSet::new();
    };

    let mut path = HashSet::new();
    let mut cur = Some(end.clone());
    while let Some(id) = cur {
        path.insert(id.clone());
        cur = predecessor.get(&id).cloned();
    }

    path
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builders::{TaskDefinitionBuilder, WorkflowDefinitionBuilder};
    use serde_json::json;

    fn noop_task(id: &str, deps: &[&str]) -> crate::types::TaskDefinition {
        TaskDefinitionBuilder::new(id, id)
            .dependencies(deps.iter().map(|s| s.to_string()).collect())
            .body_fn(|_input, _ctx| Box::pin(async { Ok(json!(null)) }))
            .build()
            .unwrap()
    }

    fn def_of(tasks: Vec<crate::types::TaskDefinition>) -> WorkflowDefinition {
        WorkflowDefinitionBuilder::new("wf", "wf")
            .tasks(tasks)
            .build()
            .unwrap()
    }

    #[test]
    fn topological_order_respects_edges() {
        let def = def_of(vec![
            noop_task("a", &[]),
            noop_task("b", &["a"]),
            noop_task("c", &["a"]),
            noop_task("d", &["b", "c"]),
        ]);
        let order = topological_order(&def).unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("a") < pos("c"));
        assert!(pos("b") < pos("d"));
        assert!(pos("c") < pos("d"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn ready_tasks_excludes_completed_and_blocked() {
        let def = def_of(vec![noop_task("a", &[]), noop_task("b", &["a"])]);
        let completed = HashSet::new();
        assert_eq!(ready_tasks(&def, &completed), vec!["a".to_string()]);

        let mut completed = HashSet::new();
        completed.insert("a".to_string());
        assert_eq!(ready_tasks(&def, &completed), vec!["b".to_string()]);
    }

    #[test]
    fn cycle_is_detected() {
        let def = WorkflowDefinitionBuilder::new("wf", "wf")
            .tasks(vec![noop_task("a", &["b"]), noop_task("b", &["a"])])
            .build();
        assert!(def.is_err());
    }

    #[test]
    fn critical_path_follows_longest_chain() {
        let def = def_of(vec![
            noop_task("a", &[]),
            noop_task("b", &["a"]),
            noop_task("c", &["b"]),
            noop_task("d", &["a"]),
        ]);
        let path = critical_path(&def);
        assert!(path.contains("a"));
        assert!(path.contains("b"));
        assert!(path.contains("c"));
        assert!(!path.contains("d"));
    }
}
