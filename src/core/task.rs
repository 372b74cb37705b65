//! Task records: identity, state machine, and captured streams.

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::util::clock::now_utc;

/// Status of a task in the scheduler lifecycle.
///
/// Transitions are forward-only:
/// `Created → Scheduled → Running → {Completed, Failed, Cancelled, TimedOut}`
/// with pre-start cancellation short-circuiting to `Cancelled`. Terminal
/// states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskStatus {
    /// Accepted by the scheduler, not yet handed to the executor.
    Created,
    /// Queued by the executor, waiting on pool admission.
    Scheduled,
    /// Holding an admission permit and a worker context.
    Running,
    /// The engine returned without error.
    Completed,
    /// The engine raised an error.
    Failed,
    /// The cancel signal fired and the engine wound down.
    Cancelled,
    /// The deadline elapsed before the engine finished.
    TimedOut,
}

impl TaskStatus {
    /// Whether this status is absorbing.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::TimedOut
        )
    }

    /// Whether a task in this status counts against pool-idle requirements.
    #[must_use]
    pub fn is_active(self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Created => "Created",
            Self::Scheduled => "Scheduled",
            Self::Running => "Running",
            Self::Completed => "Completed",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
            Self::TimedOut => "TimedOut",
        };
        f.write_str(text)
    }
}

/// One progress record emitted by a running script.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressRecord {
    /// What the script reports it is doing.
    pub activity: String,
    /// Percent complete, when the script reports one.
    pub percent_complete: Option<i32>,
    /// Free-form status line.
    pub status_description: Option<String>,
}

/// Ordered, drainable capture queue for one stream.
struct StreamBuffer<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T: Clone> StreamBuffer<T> {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }

    fn push(&self, item: T) {
        self.items.lock().push_back(item);
    }

    /// Snapshot in emission order. `keep = false` drains atomically; drained
    /// items are never re-delivered.
    fn receive(&self, keep: bool) -> Vec<T> {
        let mut items = self.items.lock();
        if keep {
            items.iter().cloned().collect()
        } else {
            items.drain(..).collect()
        }
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }
}

/// Mutable portion of a task record, guarded by one lock so status and
/// timestamps always change together.
struct TaskState {
    status: TaskStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failure_reason: Option<String>,
    last_progress: Option<ProgressRecord>,
}

/// A submitted unit of work and everything captured about it.
///
/// Handed out as `Arc<TaskRecord>`; the handle stays valid after the task
/// reaches a terminal state and even after retention evicts it from its
/// pool's index.
pub struct TaskRecord {
    id: Uuid,
    name: Option<String>,
    pool_name: String,
    script: String,
    arguments: Vec<Value>,
    deadline: Option<Duration>,
    created_at: DateTime<Utc>,
    state: Mutex<TaskState>,
    output: StreamBuffer<Value>,
    errors: StreamBuffer<Value>,
    progress: StreamBuffer<ProgressRecord>,
    cancel: CancellationToken,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl TaskRecord {
    pub(crate) fn new(
        name: Option<String>,
        pool_name: String,
        script: String,
        arguments: Vec<Value>,
        deadline: Option<Duration>,
    ) -> Self {
        let (done_tx, done_rx) = watch::channel(false);
        Self {
            id: Uuid::new_v4(),
            name: name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty()),
            pool_name,
            script,
            arguments,
            deadline,
            created_at: now_utc(),
            state: Mutex::new(TaskState {
                status: TaskStatus::Created,
                started_at: None,
                completed_at: None,
                failure_reason: None,
                last_progress: None,
            }),
            output: StreamBuffer::new(),
            errors: StreamBuffer::new(),
            progress: StreamBuffer::new(),
            cancel: CancellationToken::new(),
            done_tx,
            done_rx,
        }
    }

    /// Process-unique identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Optional short label; never used for lookup.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The pool this task is bound to; immutable after submission.
    #[must_use]
    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    /// The script body, frozen at submission.
    #[must_use]
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Positional arguments, frozen at submission.
    #[must_use]
    pub fn arguments(&self) -> &[Value] {
        &self.arguments
    }

    /// Per-task deadline, measured from the moment execution begins.
    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Submission timestamp.
    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Current lifecycle status.
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    /// When execution began, once it has.
    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().started_at
    }

    /// When the task reached a terminal state, once it has.
    #[must_use]
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.state.lock().completed_at
    }

    /// Wall-clock run time, once both endpoints exist.
    #[must_use]
    pub fn duration(&self) -> Option<Duration> {
        let state = self.state.lock();
        match (state.started_at, state.completed_at) {
            (Some(started), Some(completed)) => (completed - started).to_std().ok(),
            _ => None,
        }
    }

    /// Why the task failed, for Failed (and diagnostically for TimedOut).
    #[must_use]
    pub fn failure_reason(&self) -> Option<String> {
        self.state.lock().failure_reason.clone()
    }

    /// The most recent progress record observed.
    #[must_use]
    pub fn last_progress(&self) -> Option<ProgressRecord> {
        self.state.lock().last_progress.clone()
    }

    /// One-shot trigger requesting cooperative stop.
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// A receiver that flips to `true` when the task reaches a terminal
    /// state. Await `rx.wait_for(|done| *done)` to join the task.
    #[must_use]
    pub fn completion(&self) -> watch::Receiver<bool> {
        self.done_rx.clone()
    }

    /// Whether the task has reached a terminal state.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.status().is_terminal()
    }

    /// Drain or peek the captured output stream in emission order.
    #[must_use]
    pub fn receive_output(&self, keep: bool) -> Vec<Value> {
        self.output.receive(keep)
    }

    /// Drain or peek the captured error stream in emission order.
    #[must_use]
    pub fn receive_errors(&self, keep: bool) -> Vec<Value> {
        self.errors.receive(keep)
    }

    /// Drain or peek the captured progress stream in emission order.
    #[must_use]
    pub fn receive_progress(&self, keep: bool) -> Vec<ProgressRecord> {
        self.progress.receive(keep)
    }

    /// Serializable point-in-time view for programmatic consumers.
    #[must_use]
    pub fn snapshot(&self) -> TaskSnapshot {
        let state = self.state.lock();
        let duration = match (state.started_at, state.completed_at) {
            (Some(started), Some(completed)) => (completed - started).to_std().ok(),
            _ => None,
        };
        TaskSnapshot {
            id: self.id,
            name: self.name.clone(),
            pool_name: self.pool_name.clone(),
            status: state.status,
            created_at: self.created_at,
            started_at: state.started_at,
            completed_at: state.completed_at,
            duration,
            failure_reason: state.failure_reason.clone(),
            last_progress: state.last_progress.clone(),
            output_count: self.output.len(),
            error_count: self.errors.len(),
            progress_count: self.progress.len(),
        }
    }

    /// `Created → Scheduled`. Returns false if the edge is not available.
    pub(crate) fn mark_scheduled(&self) -> bool {
        let mut state = self.state.lock();
        if state.status != TaskStatus::Created {
            return false;
        }
        state.status = TaskStatus::Scheduled;
        true
    }

    /// `Scheduled → Running`, stamping `started_at` exactly once.
    pub(crate) fn mark_running(&self) -> bool {
        let mut state = self.state.lock();
        if state.status != TaskStatus::Scheduled {
            return false;
        }
        state.status = TaskStatus::Running;
        state.started_at = Some(now_utc());
        true
    }

    /// Enter a terminal state from any non-terminal state, stamping
    /// `completed_at` and releasing waiters. A task finishes at most once;
    /// a second call is a no-op returning false.
    pub(crate) fn mark_finished(&self, status: TaskStatus, failure_reason: Option<String>) -> bool {
        debug_assert!(status.is_terminal());
        let mut state = self.state.lock();
        if state.status.is_terminal() {
            return false;
        }
        state.status = status;
        state.completed_at = Some(now_utc());
        if failure_reason.is_some() {
            state.failure_reason = failure_reason;
        }
        drop(state);
        self.done_tx.send_replace(true);
        true
    }

    pub(crate) fn append_output(&self, item: Value) {
        self.output.push(item);
    }

    pub(crate) fn append_error(&self, item: Value) {
        self.errors.push(item);
    }

    /// Append a progress record, overwriting the last-progress snapshot.
    pub(crate) fn record_progress(&self, record: ProgressRecord) {
        self.state.lock().last_progress = Some(record.clone());
        self.progress.push(record);
    }
}

impl fmt::Debug for TaskRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("pool", &self.pool_name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Serializable point-in-time view of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// Task identifier.
    pub id: Uuid,
    /// Optional label.
    pub name: Option<String>,
    /// Owning pool.
    pub pool_name: String,
    /// Status at snapshot time.
    pub status: TaskStatus,
    /// Submission timestamp.
    pub created_at: DateTime<Utc>,
    /// Execution start, when begun.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal-state entry, when reached.
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock run time, when finished.
    pub duration: Option<Duration>,
    /// Failure reason, when captured.
    pub failure_reason: Option<String>,
    /// Most recent progress record.
    pub last_progress: Option<ProgressRecord>,
    /// Items currently buffered on the output stream.
    pub output_count: usize,
    /// Items currently buffered on the error stream.
    pub error_count: usize,
    /// Items currently buffered on the progress stream.
    pub progress_count: usize,
}
