//! Execution pools: worker banks, admission gates, and per-pool defaults.
//!
//! A pool owns a bank of reusable engine worker contexts, materialized
//! lazily from the pool's template up to `max_workers`. Idle workers ride a
//! channel; checkout pops one or creates a fresh context, and the admission
//! semaphore guarantees at most `max_workers` contexts are ever checked out,
//! so the bank can never grow past the ceiling. Template rebuilds bump an
//! epoch so stale workers drain out of the bank instead of leaking old
//! session state into new tasks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::builders::build_template;
use crate::config::{PoolInfo, SchedulerSettings, SessionSettings};
use crate::core::error::SchedulerError;
use crate::core::task::TaskRecord;
use crate::engine::{EngineError, ScriptEngine, WorkerTemplate};

/// A worker context checked out of (or destined for) the bank.
pub(crate) struct Worker<C> {
    /// The engine context itself.
    pub(crate) context: C,
    /// Whether this worker has already run the pool's init script.
    pub(crate) init_done: bool,
    epoch: u64,
}

struct PoolConfig {
    settings: SchedulerSettings,
    session: SessionSettings,
    template: Arc<WorkerTemplate>,
}

impl<E: ScriptEngine> std::fmt::Debug for Pool<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("name", &self.name).finish()
    }
}

/// A named execution pool.
pub struct Pool<E: ScriptEngine> {
    name: String,
    engine: Arc<E>,
    gate: Arc<Semaphore>,
    config: RwLock<PoolConfig>,
    idle_tx: Sender<Worker<E::Context>>,
    idle_rx: Receiver<Worker<E::Context>>,
    /// Rebuild generation; workers from older generations are dropped on
    /// sight rather than reused.
    epoch: AtomicU64,
    /// Contexts materialized under the current epoch (checked out + idle).
    created: AtomicUsize,
    tasks: RwLock<HashMap<Uuid, Arc<TaskRecord>>>,
}

impl<E: ScriptEngine> Pool<E> {
    pub(crate) fn new(
        name: String,
        engine: Arc<E>,
        settings: SchedulerSettings,
        session: SessionSettings,
    ) -> Result<Self, SchedulerError> {
        settings
            .validate()
            .map_err(SchedulerError::InvalidArgument)?;
        let template = build_template(engine.as_ref(), &session)?;
        let (idle_tx, idle_rx) = unbounded();
        let pool = Self {
            gate: Arc::new(Semaphore::new(settings.max_workers)),
            name,
            engine,
            config: RwLock::new(PoolConfig {
                settings,
                session: session.normalized(),
                template: Arc::new(template),
            }),
            idle_tx,
            idle_rx,
            epoch: AtomicU64::new(0),
            created: AtomicUsize::new(0),
            tasks: RwLock::new(HashMap::new()),
        };
        pool.seed_to_min()?;
        tracing::info!(pool = %pool.name, "pool created");
        Ok(pool)
    }

    /// Pool name (lowercase-normalized key).
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn gate(&self) -> Arc<Semaphore> {
        Arc::clone(&self.gate)
    }

    pub(crate) fn settings(&self) -> SchedulerSettings {
        self.config.read().settings.clone()
    }

    pub(crate) fn session(&self) -> SessionSettings {
        self.config.read().session.clone()
    }

    pub(crate) fn template(&self) -> Arc<WorkerTemplate> {
        Arc::clone(&self.config.read().template)
    }

    /// Point-in-time description for listings.
    #[must_use]
    pub fn info(&self) -> PoolInfo {
        let config = self.config.read();
        PoolInfo {
            name: self.name.clone(),
            min_workers: config.settings.min_workers,
            max_workers: config.settings.max_workers,
            retention: config.settings.retention,
            modules: config.session.modules.clone(),
            init_script: config.session.init_script.clone(),
            task_count: self.task_count(),
            active_count: self.active_count(),
        }
    }

    // ------------------------------------------------------------------
    // Task index
    // ------------------------------------------------------------------

    pub(crate) fn register_task(&self, task: Arc<TaskRecord>) {
        self.tasks.write().insert(task.id(), task);
    }

    pub(crate) fn get_task(&self, id: Uuid) -> Option<Arc<TaskRecord>> {
        self.tasks.read().get(&id).cloned()
    }

    pub(crate) fn tasks(&self) -> Vec<Arc<TaskRecord>> {
        self.tasks.read().values().cloned().collect()
    }

    pub(crate) fn remove_task(&self, id: Uuid) -> Option<Arc<TaskRecord>> {
        self.tasks.write().remove(&id)
    }

    /// Tasks currently indexed (all states).
    #[must_use]
    pub fn task_count(&self) -> usize {
        self.tasks.read().len()
    }

    /// Tasks in a non-terminal state.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|task| !task.is_finished())
            .count()
    }

    /// Evict terminal tasks whose completion age reached the retention
    /// window. Active tasks are never evicted. Returns the eviction count.
    pub(crate) fn evict_expired(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.settings().retention)
            .unwrap_or(chrono::TimeDelta::MAX);
        let mut tasks = self.tasks.write();
        let before = tasks.len();
        tasks.retain(|_, task| match task.completed_at() {
            Some(completed) => now - completed < retention,
            None => true,
        });
        before - tasks.len()
    }

    // ------------------------------------------------------------------
    // Worker bank
    // ------------------------------------------------------------------

    /// Check out a worker for exclusive use by one task.
    ///
    /// Callers must hold an admission permit; that alone bounds the number
    /// of live contexts, because a new context is only materialized when the
    /// idle bank is empty.
    pub(crate) fn checkout_worker(&self) -> Result<Worker<E::Context>, EngineError> {
        let current = self.epoch.load(Ordering::SeqCst);
        while let Ok(worker) = self.idle_rx.try_recv() {
            if worker.epoch == current {
                return Ok(worker);
            }
            // Stale generation: drop and keep looking.
        }
        let context = self.engine.create_context(&self.template())?;
        self.created.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(pool = %self.name, "materialized worker context");
        Ok(Worker {
            context,
            init_done: false,
            epoch: current,
        })
    }

    /// Return a worker to the bank; stale-generation workers are dropped.
    pub(crate) fn return_worker(&self, worker: Worker<E::Context>) {
        if worker.epoch == self.epoch.load(Ordering::SeqCst) {
            let _ = self.idle_tx.send(worker);
        }
    }

    fn seed_to_min(&self) -> Result<(), SchedulerError> {
        let min = self.config.read().settings.min_workers;
        self.seed_to(min)
    }

    fn seed_to(&self, min: usize) -> Result<(), SchedulerError> {
        let current = self.epoch.load(Ordering::SeqCst);
        let template = self.template();
        while self.created.load(Ordering::SeqCst) < min {
            let context = self.engine.create_context(&template)?;
            self.created.fetch_add(1, Ordering::SeqCst);
            let _ = self.idle_tx.send(Worker {
                context,
                init_done: false,
                epoch: current,
            });
        }
        Ok(())
    }

    fn trim_idle_to(&self, max: usize) {
        while self.created.load(Ordering::SeqCst) > max {
            match self.idle_rx.try_recv() {
                Ok(worker) => {
                    drop(worker);
                    self.created.fetch_sub(1, Ordering::SeqCst);
                }
                Err(_) => break,
            }
        }
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Apply new scheduler settings: resize the admission gate, propagate the
    /// bounds to the worker bank, then record the values.
    ///
    /// Shrinking absorbs the delta by reclaiming permits within `wait`; on
    /// expiry the recorded limits stay unchanged and the caller gets a
    /// structured error instead of an indefinitely held configuration lock.
    pub(crate) async fn apply_settings(
        &self,
        requested: SchedulerSettings,
        wait: Duration,
    ) -> Result<(), SchedulerError> {
        requested
            .validate()
            .map_err(SchedulerError::InvalidArgument)?;
        let old_max = self.settings().max_workers;
        let new_max = requested.max_workers;

        if new_max > old_max {
            self.gate.add_permits(new_max - old_max);
        } else if new_max < old_max {
            let delta = old_max - new_max;
            let delta_u32 =
                u32::try_from(delta).map_err(|_| SchedulerError::ResizeTimeout {
                    pool: self.name.clone(),
                    permits: delta,
                })?;
            match tokio::time::timeout(wait, self.gate().acquire_many_owned(delta_u32)).await {
                Ok(Ok(permits)) => permits.forget(),
                // Gate closed: the pool is being torn down, nothing to absorb.
                Ok(Err(_)) => {}
                Err(_) => {
                    tracing::warn!(
                        pool = %self.name,
                        delta,
                        "gate shrink timed out; limits unchanged"
                    );
                    return Err(SchedulerError::ResizeTimeout {
                        pool: self.name.clone(),
                        permits: delta,
                    });
                }
            }
        }

        self.trim_idle_to(new_max);
        self.seed_to(requested.min_workers)?;
        self.config.write().settings = requested;
        tracing::info!(pool = %self.name, "pool limits updated");
        Ok(())
    }

    /// Atomically replace the session settings, template, and worker bank.
    ///
    /// Fails fast while any task is active; on failure nothing changes.
    pub(crate) fn rebuild(
        &self,
        session: SessionSettings,
    ) -> Result<SessionSettings, SchedulerError> {
        let active = self.active_count();
        if active > 0 {
            return Err(SchedulerError::PoolBusy {
                pool: self.name.clone(),
                active,
            });
        }

        // Validate and build before touching any state.
        let template = build_template(self.engine.as_ref(), &session)?;
        let normalized = session.normalized();
        {
            let mut config = self.config.write();
            config.session = normalized.clone();
            config.template = Arc::new(template);
        }

        // Old-generation workers carry old session state; retire them all.
        self.epoch.fetch_add(1, Ordering::SeqCst);
        while self.idle_rx.try_recv().is_ok() {}
        self.created.store(0, Ordering::SeqCst);
        self.seed_to_min()?;
        tracing::info!(pool = %self.name, "session rebuilt; worker bank replaced");
        Ok(normalized)
    }

    /// Fire every active task's cancel signal and close the admission gate
    /// so queued tasks stop waiting. Used by forced removal and dispose.
    pub(crate) fn cancel_active(&self) {
        self.gate.close();
        for task in self.tasks.read().values() {
            if !task.is_finished() {
                task.cancel_token().cancel();
            }
        }
    }
}
