//! Per-task run loop.
//!
//! One `run_task` future per submitted task: wait on the pool's admission
//! gate, check out a worker, wire the task's stream sink, compose the stop
//! signal from user cancellation and the optional deadline, drive the
//! engine, classify the terminal state, and hand the worker back. The
//! admission permit and the worker are released on every exit path.
//!
//! Classification follows firing order, not final token state: whichever of
//! cancel/deadline records the stop cause first wins, and a deadline-first
//! stop absorbs any engine error raised while the script winds down.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::core::events::{EventBus, TaskEventKind};
use crate::core::pool::Pool;
use crate::core::task::{ProgressRecord, TaskRecord, TaskStatus};
use crate::engine::{EngineError, ScriptEngine, StreamSink, WorkerContext};
use crate::runtime::Spawn;

const CAUSE_NONE: u8 = 0;
const CAUSE_CANCEL: u8 = 1;
const CAUSE_DEADLINE: u8 = 2;

/// Sink wiring a running script to its task's buffers and the event bus.
struct TaskStreamSink<S: Spawn> {
    task: Arc<TaskRecord>,
    bus: EventBus<S>,
}

impl<S: Spawn + Clone + Send + Sync + 'static> StreamSink for TaskStreamSink<S> {
    fn output(&self, item: Value) {
        self.task.append_output(item);
    }

    fn error(&self, item: Value) {
        self.task.append_error(item);
    }

    fn progress(&self, record: ProgressRecord) {
        self.task.record_progress(record.clone());
        self.bus
            .publish(&self.task, TaskEventKind::Progress, Some(record));
    }
}

/// Map the recorded stop cause and the engine outcome to a terminal state.
fn classify(cause: u8, result: Result<(), EngineError>) -> (TaskStatus, Option<String>) {
    match cause {
        // The deadline fired first; an engine error raised during wind-down
        // is kept as diagnostics without changing the classification.
        CAUSE_DEADLINE => (TaskStatus::TimedOut, result.err().map(|e| e.to_string())),
        CAUSE_CANCEL => (TaskStatus::Cancelled, None),
        _ => match result {
            Ok(()) => (TaskStatus::Completed, None),
            Err(err) => (TaskStatus::Failed, Some(err.to_string())),
        },
    }
}

fn finish<S: Spawn + Clone + Send + Sync + 'static>(
    task: &Arc<TaskRecord>,
    bus: &EventBus<S>,
    status: TaskStatus,
    reason: Option<String>,
) {
    // A failure reason surfaces on the error stream as well; a TimedOut
    // reason stays out of it and is diagnostics only.
    if status == TaskStatus::Failed {
        if let Some(reason) = &reason {
            task.append_error(Value::from(reason.clone()));
        }
    }
    if task.mark_finished(status, reason) {
        tracing::debug!(task_id = %task.id(), status = %status, "task reached terminal state");
        bus.publish(task, TaskEventKind::for_terminal(status), None);
    }
}

/// Drive one task from `Scheduled` to a terminal state.
pub(crate) async fn run_task<E, S>(
    pool: Arc<Pool<E>>,
    task: Arc<TaskRecord>,
    bus: EventBus<S>,
    spawner: S,
) where
    E: ScriptEngine,
    S: Spawn + Clone + Send + Sync + 'static,
{
    if task.mark_scheduled() {
        bus.publish(&task, TaskEventKind::Scheduled, None);
    }

    // Admission. A cancel signal fired at any point up to (and including)
    // the wait resolves the task to Cancelled without running.
    let permit = if task.cancel_token().is_cancelled() {
        None
    } else {
        tokio::select! {
            biased;
            () = task.cancel_token().cancelled() => None,
            permit = pool.gate().acquire_owned() => permit.ok(),
        }
    };
    let Some(permit) = permit else {
        finish(&task, &bus, TaskStatus::Cancelled, None);
        return;
    };
    if task.cancel_token().is_cancelled() {
        drop(permit);
        finish(&task, &bus, TaskStatus::Cancelled, None);
        return;
    }

    task.mark_running();
    bus.publish(&task, TaskEventKind::Started, None);

    let mut worker = match pool.checkout_worker() {
        Ok(worker) => worker,
        Err(err) => {
            drop(permit);
            finish(&task, &bus, TaskStatus::Failed, Some(err.to_string()));
            return;
        }
    };

    // Compose the stop signal. Each source records itself as the first cause
    // before firing the shared stop token; `settle` retires both watchers
    // once the engine has returned.
    let stop = CancellationToken::new();
    let settle = CancellationToken::new();
    let cause = Arc::new(AtomicU8::new(CAUSE_NONE));

    {
        let user = task.cancel_token().clone();
        let stop = stop.clone();
        let settle = settle.clone();
        let cause = Arc::clone(&cause);
        spawner.spawn(async move {
            tokio::select! {
                () = settle.cancelled() => {}
                () = user.cancelled() => {
                    let _ = cause.compare_exchange(
                        CAUSE_NONE,
                        CAUSE_CANCEL,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                    stop.cancel();
                }
            }
        });
    }
    // The deadline is measured from the start of execution, which is now.
    if let Some(deadline) = task.deadline() {
        let stop = stop.clone();
        let settle = settle.clone();
        let cause = Arc::clone(&cause);
        spawner.spawn(async move {
            tokio::select! {
                () = settle.cancelled() => {}
                () = tokio::time::sleep(deadline) => {
                    let _ = cause.compare_exchange(
                        CAUSE_NONE,
                        CAUSE_DEADLINE,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                    stop.cancel();
                }
            }
        });
    }

    let sink = TaskStreamSink {
        task: Arc::clone(&task),
        bus: bus.clone(),
    };
    let template = pool.template();

    // One-shot init runs first on a worker that has not seen it, inside the
    // same stop scope as the body.
    let mut result = Ok(());
    if let Some(init) = template.init_script() {
        if !worker.init_done {
            result = worker.context.run(init, &[], &sink, &stop).await;
            if result.is_ok() {
                worker.init_done = true;
            }
        }
    }
    if result.is_ok() {
        result = worker
            .context
            .run(task.script(), task.arguments(), &sink, &stop)
            .await;
    }

    let observed_cause = cause.load(Ordering::SeqCst);
    settle.cancel();
    let (status, reason) = classify(observed_cause, result);

    pool.return_worker(worker);
    drop(permit);
    finish(&task, &bus, status, reason);
}
