//! Resource accounting: named capacity pools shared across concurrently
//! running tasks within (and across) workflows.
//!
//! The teacher has no direct counterpart: concurrency there is capped by a
//! single `tokio::sync::Semaphore` permit count. This module generalizes
//! that idea to named, independently-capped resources (`"cpu"`, `"memory"`,
//! a custom `"gpu"` pool, ...), tracked with plain `HashMap` bookkeeping
//! behind a `Mutex` rather than one semaphore per resource, since allocation
//! here must be all-or-nothing across a task's whole requirement set.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::types::{ResourceRequirements, TaskId, WorkflowId};

/// A resource's total capacity: either a fixed numeric cap or unbounded.
///
/// Kept as an explicit enum rather than `f64::INFINITY` so arithmetic on
/// caps never has to reason about floating-point infinity propagating
/// through utilization calculations (design note).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Cap {
    Bounded(f64),
    Unbounded,
}

impl Cap {
    fn allows(self, allocated: f64, requested: f64) -> bool {
        match self {
            Cap::Unbounded => true,
            Cap::Bounded(total) => allocated + requested <= total,
        }
    }
}

/// A single attempt's allocation, keyed so retries of the same task never
/// collide with a still-live prior attempt (which should already have
/// released, but defensively keeps retries distinguishable in logs).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AllocationKey {
    pub workflow_id: WorkflowId,
    pub task_id: TaskId,
    pub retry_count: u32,
}

struct Inner {
    totals: HashMap<String, Cap>,
    allocated: HashMap<String, f64>,
    grants: HashMap<AllocationKey, ResourceRequirements>,
}

/// Shared, thread-safe resource ledger. One instance is shared by an
/// [`crate::engine::Engine`] across all workflows it runs concurrently,
/// which is what makes the cross-workflow first-come-first-served policy
/// possible: allocation is a single global critical section.
pub struct ResourceManager {
    inner: Mutex<Inner>,
}

impl ResourceManager {
    /// Build a manager from an initial totals table. A resource name absent
    /// from `totals` is treated as unbounded when requested.
    pub fn new(totals: HashMap<String, Cap>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                totals,
                allocated: HashMap::new(),
                grants: HashMap::new(),
            }),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(HashMap::new())
    }

    fn cap_of(inner: &Inner, name: &str) -> Cap {
        *inner.totals.get(name).unwrap_or(&Cap::Unbounded)
    }

    /// Whether `requirements` could be granted right now, without mutating
    /// state. Used by the scheduler to decide whether a ready task is a
    /// schedulable candidate before it commits to allocating.
    pub fn can_allocate(&self, requirements: &ResourceRequirements) -> bool {
        let inner = self.inner.lock().unwrap();
        requirements.iter().all(|(name, need)| {
            let cap = Self::cap_of(&inner, name);
            let have = *inner.allocated.get(name).unwrap_or(&0.0);
            cap.allows(have, *need)
        })
    }

    /// Atomically check-and-commit an allocation for a single task attempt.
    /// Returns `false` (no partial allocation, no state change) if any
    /// single resource in `requirements` cannot be satisfied.
    pub fn allocate(&self, key: AllocationKey, requirements: ResourceRequirements) -> bool {
        let mut inner = self.inner.lock().unwrap();

        let all_ok = requirements.iter().all(|(name, need)| {
            let cap = Self::cap_of(&inner, name);
            let have = *inner.allocated.get(name).unwrap_or(&0.0);
            cap.allows(have, *need)
        });
        if !all_ok {
            return false;
        }

        for (name, need) in &requirements {
            *inner.allocated.entry(name.clone()).or_insert(0.0) += need;
        }
        inner.grants.insert(key, requirements);
        true
    }

    /// Release a previously granted allocation. Idempotent: releasing an
    /// unknown or already-released key is a no-op, since a task's
    /// completion handler and its cancellation handler can both attempt to
    /// release the same attempt.
    pub fn release(&self, key: &AllocationKey) {
        let mut inner = self.inner.lock().unwrap();
        let Some(requirements) = inner.grants.remove(key) else {
            return;
        };
        for (name, amount) in requirements {
            if let Some(have) = inner.allocated.get_mut(&name) {
                *have = (*have - amount).max(0.0);
            }
        }
    }

    /// Fraction of capacity in use per resource, in `[0.0, 1.0]`. Unbounded
    /// resources always report `0.0` utilization, since there is no
    /// meaningful denominator.
    pub fn utilization(&self) -> HashMap<String, f64> {
        let inner = self.inner.lock().unwrap();
        let mut out = HashMap::new();
        for (name, cap) in &inner.totals {
            let have = *inner.allocated.get(name).unwrap_or(&0.0);
            let util = match cap {
                Cap::Unbounded => 0.0,
                Cap::Bounded(total) if *total > 0.0 => (have / total).clamp(0.0, 1.0),
                Cap::Bounded(_) => 0.0,
            };
            out.insert(name.clone(), util);
        }
        out
    }

    /// Update a resource's total capacity. Already-allocated amounts are
    /// left untouched: shrinking a cap below current usage does not evict
    /// running tasks, it only blocks new allocations until usage drops.
    pub fn update_total(&self, name: impl Into<String>, cap: Cap) {
        let mut inner = self.inner.lock().unwrap();
        inner.totals.insert(name.into(), cap);
    }

    /// Whether `requirements` can never be satisfied even with nothing else
    /// allocated, i.e. it exceeds the resource's total cap outright. Used to
    /// detect permanently-starved tasks (reported as
    /// `ResourceStarvationError`) rather than leaving them queued forever.
    pub fn exceeds_cap(&self, requirements: &ResourceRequirements) -> Option<(String, f64, f64)> {
        let inner = self.inner.lock().unwrap();
        for (name, need) in requirements {
            if let Cap::Bounded(total) = Self::cap_of(&inner, name) {
                if *need > total {
                    return Some((name.clone(), *need, total));
                }
            }
        }
        None
    }
}
