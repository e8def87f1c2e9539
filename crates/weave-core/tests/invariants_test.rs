//! Property-based tests over the quantified invariants: dependency
//! ordering, resource caps, concurrency limits, and result-set exactness
//! hold for any well-formed, randomly generated DAG, not just the
//! hand-picked scenarios in `scenarios_test.rs`.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use proptest::prelude::*;
use serde_json::json;
use weave_core::{
    Cap, Engine, ExecuteOptions, Priority, TaskDefinitionBuilder, WorkflowDefinitionBuilder,
    WorkflowState,
};

/// A small random DAG: `n` tasks, each depending only on lower-indexed
/// tasks (guarantees acyclicity by construction), with a random subset of
/// edges actually present.
fn arb_dag(max_nodes: usize) -> impl Strategy<Value = Vec<Vec<usize>>> {
    (2..=max_nodes).prop_flat_map(|n| {
        let edge_choices: Vec<_> = (0..n)
            .map(|i| proptest::collection::vec(any::<bool>(), i))
            .collect();
        edge_choices.prop_map(move |per_node_flags| {
            per_node_flags
                .into_iter()
                .enumerate()
                .map(|(i, flags)| {
                    flags
                        .into_iter()
                        .enumerate()
                        .filter(|(_, keep)| *keep)
                        .map(|(j, _)| j)
                        .filter(|&j| j < i)
                        .collect::<Vec<usize>>()
                })
                .collect()
        })
    })
}

fn task_id(i: usize) -> String {
    format!("t{i}")
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// For any acyclic random DAG, execution completes, every task observed
    /// its own start strictly after all its dependencies' completions, and
    /// the result set is exactly the set of defined tasks (every task ran
    /// exactly once, nothing left over, nothing missing).
    #[test]
    fn dependencies_are_always_satisfied_before_running(deps in arb_dag(8)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let completion_order = Arc::new(Mutex::new(Vec::<String>::new()));

            let mut tasks = Vec::with_capacity(deps.len());
            for (i, dep_indices) in deps.iter().enumerate() {
                let id = task_id(i);
                let dep_ids: Vec<String> = dep_indices.iter().map(|&j| task_id(j)).collect();
                let completion_order = completion_order.clone();
                let id_for_body = id.clone();
                let task = TaskDefinitionBuilder::new(id.clone(), id.clone())
                    .dependencies(dep_ids)
                    .body_fn(move |_input, _ctx| {
                        let completion_order = completion_order.clone();
                        let id_for_body = id_for_body.clone();
                        Box::pin(async move {
                            completion_order.lock().unwrap().push(id_for_body);
                            Ok(json!(null))
                        })
                    })
                    .build()
                    .unwrap();
                tasks.push(task);
            }

            let def = WorkflowDefinitionBuilder::new("prop-dag", "prop-dag")
                .tasks(tasks)
                .build()
                .unwrap();

            let engine = Engine::with_resource_totals(HashMap::new());
            let result = engine.execute(&def, ExecuteOptions::default()).await.unwrap();

            prop_assert_eq!(result.state, WorkflowState::Completed);

            let order = completion_order.lock().unwrap();
            let position: HashMap<&String, usize> =
                order.iter().enumerate().map(|(pos, id)| (id, pos)).collect();

            for (i, dep_indices) in deps.iter().enumerate() {
                let id = task_id(i);
                for &j in dep_indices {
                    let dep_id = task_id(j);
                    prop_assert!(position[&dep_id] < position[&id]);
                }
            }

            let expected: HashSet<String> = (0..deps.len()).map(task_id).collect();
            let actual: HashSet<String> = result.results.keys().cloned().collect();
            prop_assert_eq!(actual, expected);

            Ok(())
        })?;
    }

    /// For any random set of tasks each requesting a random amount of a
    /// single capped resource (always individually satisfiable), the number
    /// of tasks observed running concurrently never exceeds what the cap
    /// allows.
    #[test]
    fn resource_cap_is_never_exceeded(
        demands in proptest::collection::vec(1u32..=20, 2..8),
        cap in 20u32..=40,
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let in_use = Arc::new(AtomicI64::new(0));
            let peak = Arc::new(AtomicI64::new(0));

            let tasks: Vec<_> = demands
                .iter()
                .enumerate()
                .map(|(i, &demand)| {
                    let in_use = in_use.clone();
                    let peak = peak.clone();
                    TaskDefinitionBuilder::new(task_id(i), task_id(i))
                        .resource("cpu", demand as f64)
                        .body_fn(move |_input, _ctx| {
                            let in_use = in_use.clone();
                            let peak = peak.clone();
                            let demand = demand as i64;
                            Box::pin(async move {
                                let now = in_use.fetch_add(demand, Ordering::SeqCst) + demand;
                                peak.fetch_max(now, Ordering::SeqCst);
                                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                                in_use.fetch_sub(demand, Ordering::SeqCst);
                                Ok(json!(null))
                            })
                        })
                        .build()
                        .unwrap()
                })
                .collect();

            let def = WorkflowDefinitionBuilder::new("prop-resources", "prop-resources")
                .tasks(tasks)
                .build()
                .unwrap();

            let engine = Engine::with_resource_totals(HashMap::from([(
                "cpu".to_string(),
                Cap::Bounded(cap as f64),
            )]));
            let result = engine.execute(&def, ExecuteOptions::default()).await.unwrap();

            prop_assert_eq!(result.state, WorkflowState::Completed);
            prop_assert!(peak.load(Ordering::SeqCst) <= cap as i64);

            Ok(())
        })?;
    }

    /// For any random independent task set, the number observed running
    /// concurrently never exceeds the workflow's `concurrency_limit`.
    #[test]
    fn concurrency_limit_is_never_exceeded(task_count in 2usize..10, limit in 1usize..5) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let current = Arc::new(AtomicUsize::new(0));
            let peak = Arc::new(AtomicUsize::new(0));

            let tasks: Vec<_> = (0..task_count)
                .map(|i| {
                    let current = current.clone();
                    let peak = peak.clone();
                    TaskDefinitionBuilder::new(task_id(i), task_id(i))
                        .priority(if i % 2 == 0 { Priority::High } else { Priority::Low })
                        .body_fn(move |_input, _ctx| {
                            let current = current.clone();
                            let peak = peak.clone();
                            Box::pin(async move {
                                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                                peak.fetch_max(now, Ordering::SeqCst);
                                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                                current.fetch_sub(1, Ordering::SeqCst);
                                Ok(json!(null))
                            })
                        })
                        .build()
                        .unwrap()
                })
                .collect();

            let def = WorkflowDefinitionBuilder::new("prop-concurrency", "prop-concurrency")
                .concurrency_limit(limit)
                .tasks(tasks)
                .build()
                .unwrap();

            let engine = Engine::with_resource_totals(HashMap::new());
            let result = engine.execute(&def, ExecuteOptions::default()).await.unwrap();

            prop_assert_eq!(result.state, WorkflowState::Completed);
            prop_assert!(peak.load(Ordering::SeqCst) <= limit);

            Ok(())
        })?;
    }
}
