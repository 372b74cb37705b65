//! End-to-end scheduler scenarios.
//!
//! These tests validate the full submit → admit → execute → classify path
//! against the built-in engine:
//! - Completion, cancellation, and deadline classification
//! - Progress capture and the last-progress snapshot
//! - Per-pool session isolation and one-shot init
//! - Removal guards and admission bounds

use std::time::Duration;

use serde_json::Value;

use scriptpool::config::PoolOptions;
use scriptpool::core::{Scheduler, SchedulerError, TaskStatus};
use scriptpool::engine::LocalEngine;

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

fn scheduler() -> Scheduler<LocalEngine> {
    Scheduler::new(LocalEngine::default()).expect("scheduler")
}

async fn wait(scheduler: &Scheduler<LocalEngine>, task: &scriptpool::core::TaskRecord) -> bool {
    scheduler
        .wait_task(task, Some(Duration::from_secs(5)))
        .await
        .expect("wait")
}

fn single_worker_pool() -> PoolOptions {
    PoolOptions {
        min_workers: Some(1),
        max_workers: Some(1),
        ..PoolOptions::default()
    }
}

// ============================================================================
// CLASSIFICATION SCENARIOS
// ============================================================================

#[tokio::test]
async fn simple_completion_captures_output_in_order() {
    let scheduler = scheduler();
    let task = scheduler
        .start_task(
            "sleep $0; emit done-$0",
            vec![Value::from(50)],
            None,
            None,
            None,
        )
        .unwrap();

    assert!(wait(&scheduler, &task).await);
    assert_eq!(task.status(), TaskStatus::Completed);
    assert!(task.started_at().is_some());
    assert!(task.completed_at().is_some());
    assert!(task.duration().is_some());

    let output = task.receive_output(false);
    assert!(output.contains(&Value::from("done-50")));
}

#[tokio::test]
async fn stop_task_cancels_a_running_script() {
    let scheduler = scheduler();
    let task = scheduler
        .start_task("sleep 10000; emit ignored", Vec::new(), None, None, None)
        .unwrap();

    // Let it reach the worker so the cancel exercises a running engine.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(scheduler.stop_task(&task).unwrap());

    assert!(wait(&scheduler, &task).await);
    assert_eq!(task.status(), TaskStatus::Cancelled);
    assert!(task.receive_output(false).is_empty());

    // Stopping a terminal task is a no-op returning false.
    assert!(!scheduler.stop_task(&task).unwrap());
}

#[tokio::test]
async fn deadline_elapsing_first_classifies_as_timed_out() {
    let scheduler = scheduler();
    let task = scheduler
        .start_task(
            "sleep 5000; emit late",
            Vec::new(),
            Some(Duration::from_secs(1)),
            None,
            None,
        )
        .unwrap();

    assert!(wait(&scheduler, &task).await);
    assert_eq!(task.status(), TaskStatus::TimedOut);
    assert!(task.receive_output(false).is_empty());
    // The timeout reason never reaches the error stream.
    assert!(task.receive_errors(false).is_empty());
}

#[tokio::test]
async fn engine_failure_classifies_as_failed_with_reason() {
    let scheduler = scheduler();
    let task = scheduler
        .start_task("emit partial; fail broken pipe", Vec::new(), None, None, None)
        .unwrap();

    assert!(wait(&scheduler, &task).await);
    assert_eq!(task.status(), TaskStatus::Failed);
    let reason = task.failure_reason().expect("failure reason");
    assert!(reason.contains("broken pipe"));

    // The failure surfaces on the error stream, after anything the script
    // itself emitted there.
    let errors = task.receive_errors(false);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].as_str().unwrap().contains("broken pipe"));
    assert_eq!(task.receive_output(false), vec![Value::from("partial")]);
}

// ============================================================================
// PROGRESS CAPTURE
// ============================================================================

#[tokio::test]
async fn progress_records_are_captured_with_last_progress_snapshot() {
    let scheduler = scheduler();
    let task = scheduler
        .start_task(
            "progress 0 starting; progress 50 halfway; progress 100 done",
            Vec::new(),
            None,
            None,
            None,
        )
        .unwrap();

    assert!(wait(&scheduler, &task).await);
    assert_eq!(task.status(), TaskStatus::Completed);

    let records = task.receive_progress(true);
    assert!(records.len() >= 3);
    let last = task.last_progress().expect("last progress");
    assert_eq!(last.percent_complete, Some(100));
    // Kept after the terminal transition.
    assert!(task.last_progress().is_some());
}

// ============================================================================
// POOLS AND SESSION STATE
// ============================================================================

#[tokio::test]
async fn pools_isolate_session_variables() {
    let scheduler = scheduler();
    for (pool, marker) in [("a", "A"), ("b", "B")] {
        let mut variables = std::collections::HashMap::new();
        variables.insert("marker".to_string(), Value::from(marker));
        scheduler
            .create_pool(
                pool,
                PoolOptions {
                    variables: Some(variables),
                    ..PoolOptions::default()
                },
            )
            .await
            .unwrap();
    }

    let task_a = scheduler
        .start_task("get marker", Vec::new(), None, None, Some("a"))
        .unwrap();
    let task_b = scheduler
        .start_task("get marker", Vec::new(), None, None, Some("b"))
        .unwrap();

    assert!(wait(&scheduler, &task_a).await);
    assert!(wait(&scheduler, &task_b).await);
    assert_eq!(task_a.receive_output(false), vec![Value::from("A")]);
    assert_eq!(task_b.receive_output(false), vec![Value::from("B")]);
}

#[tokio::test]
async fn init_runs_once_per_worker_across_sequential_tasks() {
    let scheduler = scheduler();
    scheduler
        .create_pool(
            "init-once",
            PoolOptions {
                init_script: Some("incr counter".into()),
                ..single_worker_pool()
            },
        )
        .await
        .unwrap();

    for _ in 0..2 {
        let task = scheduler
            .start_task("get counter", Vec::new(), None, None, Some("init-once"))
            .unwrap();
        assert!(wait(&scheduler, &task).await);
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.receive_output(false), vec![Value::from(1)]);
    }
}

// ============================================================================
// REMOVAL GUARDS
// ============================================================================

#[tokio::test]
async fn active_tasks_cannot_be_removed_until_stopped() {
    let scheduler = scheduler();
    let task = scheduler
        .start_task("sleep 10000", Vec::new(), None, None, None)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = scheduler.remove_tasks(&[task.id()]).unwrap_err();
    assert!(matches!(err, SchedulerError::TaskActive { .. }));
    assert!(scheduler.get_task(task.id()).unwrap().is_some());

    scheduler.stop_task(&task).unwrap();
    assert!(wait(&scheduler, &task).await);

    let removed = scheduler.remove_tasks(&[task.id()]).unwrap();
    assert_eq!(removed, vec![task.id()]);
    assert!(scheduler.get_task(task.id()).unwrap().is_none());
    assert!(scheduler
        .get_tasks(None, None)
        .unwrap()
        .iter()
        .all(|t| t.id() != task.id()));
}

// ============================================================================
// ADMISSION BOUNDS
// ============================================================================

#[tokio::test]
async fn concurrent_running_tasks_never_exceed_the_worker_ceiling() {
    let scheduler = scheduler();
    scheduler
        .create_pool(
            "bounded",
            PoolOptions {
                min_workers: Some(1),
                max_workers: Some(2),
                ..PoolOptions::default()
            },
        )
        .await
        .unwrap();

    let tasks: Vec<_> = (0..5)
        .map(|_| {
            scheduler
                .start_task("sleep 150", Vec::new(), None, None, Some("bounded"))
                .unwrap()
        })
        .collect();

    // Sample the pool while the batch drains; Running may never exceed the
    // ceiling at any observation point.
    let mut peak = 0usize;
    while tasks.iter().any(|task| !task.is_finished()) {
        let running = tasks
            .iter()
            .filter(|task| task.status() == TaskStatus::Running)
            .count();
        peak = peak.max(running);
        assert!(running <= 2, "admission gate leaked: {running} running");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for task in &tasks {
        assert_eq!(task.status(), TaskStatus::Completed);
    }
    assert!(peak >= 1, "sampler never observed a running task");
}

#[tokio::test]
async fn tasks_are_listed_in_creation_order() {
    let scheduler = scheduler();
    let first = scheduler
        .start_task("emit 1", Vec::new(), None, Some("first".into()), None)
        .unwrap();
    let second = scheduler
        .start_task("emit 2", Vec::new(), None, Some("second".into()), None)
        .unwrap();

    assert!(wait(&scheduler, &first).await);
    assert!(wait(&scheduler, &second).await);

    let listed = scheduler.get_tasks(Some("default"), None).unwrap();
    assert_eq!(listed.len(), 2);
    assert_eq!(listed[0].id(), first.id());
    assert_eq!(listed[1].id(), second.id());
}
