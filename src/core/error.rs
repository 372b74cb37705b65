//! Error types for scheduler operations.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::config::ModuleCheckResult;
use crate::core::task::TaskStatus;
use crate::engine::EngineError;

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A caller-supplied value failed boundary validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The named pool is not registered.
    #[error("pool `{0}` not found")]
    PoolNotFound(String),
    /// No task with the given id is indexed by any pool.
    #[error("task `{0}` not found")]
    TaskNotFound(Uuid),
    /// A mutation requires the pool to be idle, but tasks are active.
    #[error("cannot modify pool `{pool}` while tasks are active ({active} active); \
             stop or wait for them first")]
    PoolBusy {
        /// Pool that rejected the mutation.
        pool: String,
        /// Number of tasks in a non-terminal state.
        active: usize,
    },
    /// A task targeted for removal has not reached a terminal state.
    #[error("task `{id}` is still active ({status}); stop it before removing")]
    TaskActive {
        /// Identifier of the offending task.
        id: Uuid,
        /// Its status at the time of the call.
        status: TaskStatus,
    },
    /// The default pool cannot be removed.
    #[error("the default pool cannot be removed")]
    DefaultPoolProtected,
    /// One or more requested modules failed the availability probe.
    #[error("required modules are unavailable: {list}; module search path `{search_path}`",
            list = .missing
                .iter()
                .map(|check| format!("`{}` ({})", check.name, check.message))
                .collect::<Vec<_>>()
                .join(", "))]
    MissingModules {
        /// Probe result for every module that was not found.
        missing: Vec<ModuleCheckResult>,
        /// The search path consulted, verbatim.
        search_path: String,
    },
    /// Shrinking the admission gate did not reclaim permits in time.
    #[error("timed out reclaiming {permits} worker slot(s) from pool `{pool}`; \
             long-running tasks are still holding them")]
    ResizeTimeout {
        /// Pool being resized.
        pool: String,
        /// Permits that could not be reclaimed within the bounded wait.
        permits: usize,
    },
    /// An outer wait on a task elapsed before the task reached a terminal
    /// state. Produced at command boundaries; `wait_task` itself reports the
    /// elapse through its `bool` result.
    #[error("wait timed out after {0:?}; the task is still running")]
    WaitTimeout(Duration),
    /// The underlying script engine failed outside of a task run.
    #[error(transparent)]
    Engine(#[from] EngineError),
    /// The scheduler has been shut down; no further operations are accepted.
    #[error("scheduler has been disposed")]
    Disposed,
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
