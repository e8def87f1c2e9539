//! Lifecycle event emission.
//!
//! An in-process publish/subscribe registry rather than a persisted events
//! table: there is no durable store here, so a broken subscriber is logged
//! and skipped ("best effort") instead of failing the run over it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use crate::error::EngineError;
use crate::types::{TaskId, TaskValue, WorkflowId};

/// A single lifecycle event.
#[derive(Debug, Clone)]
pub enum Event {
    WorkflowStarted {
        workflow_id: WorkflowId,
        at: DateTime<Utc>,
    },
    WorkflowCompleted {
        workflow_id: WorkflowId,
        at: DateTime<Utc>,
    },
    WorkflowFailed {
        workflow_id: WorkflowId,
        at: DateTime<Utc>,
        error: EngineError,
    },
    WorkflowCancelled {
        workflow_id: WorkflowId,
        at: DateTime<Utc>,
        reason: String,
    },
    TaskStarted {
        workflow_id: WorkflowId,
        task_id: TaskId,
        at: DateTime<Utc>,
        attempt: u32,
    },
    TaskCompleted {
        workflow_id: WorkflowId,
        task_id: TaskId,
        at: DateTime<Utc>,
        result: TaskValue,
    },
    TaskFailed {
        workflow_id: WorkflowId,
        task_id: TaskId,
        at: DateTime<Utc>,
        attempt: u32,
        error: EngineError,
        will_retry: bool,
    },
    TaskRetrying {
        workflow_id: WorkflowId,
        task_id: TaskId,
        at: DateTime<Utc>,
        retry_count: u32,
        next_retry_time: DateTime<Utc>,
        error: EngineError,
    },
    TaskCancelled {
        workflow_id: WorkflowId,
        task_id: TaskId,
        at: DateTime<Utc>,
        duration_ms: u64,
    },
    TaskSkipped {
        workflow_id: WorkflowId,
        task_id: TaskId,
        at: DateTime<Utc>,
        reason: String,
    },
}

impl Event {
    pub fn workflow_id(&self) -> &WorkflowId {
        match self {
            Event::WorkflowStarted { workflow_id, .. }
            | Event::WorkflowCompleted { workflow_id, .. }
            | Event::WorkflowFailed { workflow_id, .. }
            | Event::WorkflowCancelled { workflow_id, .. }
            | Event::TaskStarted { workflow_id, .. }
            | Event::TaskCompleted { workflow_id, .. }
            | Event::TaskFailed { workflow_id, .. }
            | Event::TaskRetrying { workflow_id, .. }
            | Event::TaskCancelled { workflow_id, .. }
            | Event::TaskSkipped { workflow_id, .. } => workflow_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::WorkflowStarted { .. } => "workflow_started",
            Event::WorkflowCompleted { .. } => "workflow_completed",
            Event::WorkflowFailed { .. } => "workflow_failed",
            Event::WorkflowCancelled { .. } => "workflow_cancelled",
            Event::TaskStarted { .. } => "task_started",
            Event::TaskCompleted { .. } => "task_completed",
            Event::TaskFailed { .. } => "task_failed",
            Event::TaskRetrying { .. } => "task_retrying",
            Event::TaskCancelled { .. } => "task_cancelled",
            Event::TaskSkipped { .. } => "task_skipped",
        }
    }
}

/// A callback invoked once per emitted event, in the order events were
/// emitted. A panic inside a subscriber is caught and logged so a broken
/// handler can never take down the workflow it is observing.
pub trait Subscriber: Send + Sync {
    fn on_event(&self, event: &Event);
}

impl<F> Subscriber for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn on_event(&self, event: &Event) {
        (self)(event)
    }
}

/// Opaque handle returned by [`EventBus::subscribe`]; dropping it does
/// nothing on its own, call [`EventBus::unsubscribe`] explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// In-process publish/subscribe registry for lifecycle events. Delivery is
/// synchronous and in-order: `emit` does not return until every subscriber
/// has been invoked for that event.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<HashMap<u64, Arc<dyn Subscriber>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().unwrap().insert(id, subscriber);
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().unwrap().remove(&id.0);
    }

    /// Deliver `event` to every current subscriber, in registration order.
    /// A subscriber that panics is logged via `tracing::error!` and skipped;
    /// it does not stop delivery to the remaining subscribers and never
    /// propagates out of `emit`.
    pub fn emit(&self, event: Event) {
        let subscribers: Vec<(u64, Arc<dyn Subscriber>)> = {
            let guard = self.subscribers.lock().unwrap();
            let mut entries: Vec<_> = guard.iter().map(|(id, s)| (*id, s.clone())).collect();
            entries.sort_by_key(|(id, _)| *id);
            entries
        };

        for (id, subscriber) in subscribers {
            let event_ref = &event;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                subscriber.on_event(event_ref);
            }));
            if let Err(_panic) = result {
                tracing::error!(subscriber_id = id, event = event.name(), "event subscriber panicked");
            }
        }
    }
}
