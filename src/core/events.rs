//! Lifecycle event publication.
//!
//! Fan-out is fire-and-forget: each subscriber is invoked on its own
//! dispatch through the [`Spawn`] seam, subscriber panics are swallowed, and
//! a slow or faulty listener can never stall the executor. Delivery is
//! best-effort; for one task the only ordering promise is that `Created`
//! precedes every other event.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::core::task::{ProgressRecord, TaskRecord, TaskStatus};
use crate::runtime::Spawn;
use crate::util::clock::now_utc;

/// What happened to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskEventKind {
    /// The task was accepted and indexed.
    Created,
    /// The executor queued the task for admission.
    Scheduled,
    /// Execution began on a worker context.
    Started,
    /// The script emitted a progress record.
    Progress,
    /// Terminal: the engine returned without error.
    Completed,
    /// Terminal: the engine raised an error.
    Failed,
    /// Terminal: the cancel signal won.
    Cancelled,
    /// Terminal: the deadline won.
    TimedOut,
}

impl TaskEventKind {
    /// The terminal event kind matching a terminal task status.
    pub(crate) fn for_terminal(status: TaskStatus) -> Self {
        match status {
            TaskStatus::Completed => Self::Completed,
            TaskStatus::Failed => Self::Failed,
            TaskStatus::Cancelled => Self::Cancelled,
            TaskStatus::TimedOut => Self::TimedOut,
            TaskStatus::Created | TaskStatus::Scheduled | TaskStatus::Running => {
                unreachable!("terminal event requested for non-terminal status {status}")
            }
        }
    }
}

impl fmt::Display for TaskEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Created => "created",
            Self::Scheduled => "scheduled",
            Self::Started => "started",
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        };
        f.write_str(text)
    }
}

/// One lifecycle event, carrying the task handle it concerns.
#[derive(Clone)]
pub struct TaskEvent {
    /// The task the event concerns.
    pub task: Arc<TaskRecord>,
    /// What happened.
    pub kind: TaskEventKind,
    /// The progress record, for [`TaskEventKind::Progress`] events.
    pub progress: Option<ProgressRecord>,
    /// When the event was published.
    pub timestamp_utc: DateTime<Utc>,
}

impl fmt::Debug for TaskEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskEvent")
            .field("task", &self.task.id())
            .field("kind", &self.kind)
            .field("timestamp_utc", &self.timestamp_utc)
            .finish_non_exhaustive()
    }
}

type Subscriber = Arc<dyn Fn(&TaskEvent) + Send + Sync>;

/// Process-wide registry of lifecycle subscribers with non-blocking fan-out.
pub struct EventBus<S: Spawn> {
    spawner: S,
    subscribers: Arc<RwLock<Vec<Subscriber>>>,
}

impl<S: Spawn + Clone> Clone for EventBus<S> {
    fn clone(&self) -> Self {
        Self {
            spawner: self.spawner.clone(),
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

impl<S: Spawn + Clone + Send + Sync + 'static> EventBus<S> {
    /// Create an empty bus dispatching through `spawner`.
    pub fn new(spawner: S) -> Self {
        Self {
            spawner,
            subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a subscriber for every subsequent event.
    ///
    /// Subscribers must not block; they run on the dispatch runtime, one
    /// spawned call per event.
    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.subscribers.write().push(Arc::new(subscriber));
    }

    /// Publish an event to every registered subscriber.
    pub fn publish(
        &self,
        task: &Arc<TaskRecord>,
        kind: TaskEventKind,
        progress: Option<ProgressRecord>,
    ) {
        let snapshot: Vec<Subscriber> = self.subscribers.read().clone();
        if snapshot.is_empty() {
            return;
        }
        let event = TaskEvent {
            task: Arc::clone(task),
            kind,
            progress,
            timestamp_utc: now_utc(),
        };
        tracing::trace!(task_id = %event.task.id(), kind = %kind, "publishing task event");
        for subscriber in snapshot {
            let event = event.clone();
            self.spawner.spawn(async move {
                if catch_unwind(AssertUnwindSafe(|| subscriber(&event))).is_err() {
                    tracing::warn!(
                        task_id = %event.task.id(),
                        kind = %event.kind,
                        "event subscriber panicked; dropping"
                    );
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TokioSpawner;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn make_task() -> Arc<TaskRecord> {
        Arc::new(TaskRecord::new(
            None,
            "default".into(),
            "emit hi".into(),
            Vec::new(),
            None,
        ))
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_event() {
        let bus = EventBus::new(TokioSpawner::current());
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = Arc::clone(&hits);
            bus.subscribe(move |_event| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        let task = make_task();
        bus.publish(&task, TaskEventKind::Created, None);
        bus.publish(&task, TaskEventKind::Scheduled, None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_poison_the_bus() {
        let bus = EventBus::new(TokioSpawner::current());
        bus.subscribe(|_event| panic!("bad listener"));
        let hits = Arc::new(AtomicUsize::new(0));
        {
            let hits = Arc::clone(&hits);
            bus.subscribe(move |_event| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        let task = make_task();
        bus.publish(&task, TaskEventKind::Created, None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        bus.publish(&task, TaskEventKind::Scheduled, None);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }
}
