//! Scheduler façade: pool registry, task indexing, configuration gateway,
//! event dispatch, and the retention sweep.
//!
//! The scheduler is an explicit object constructed once at process start and
//! handed to whatever command surface sits above it; it holds no global
//! state. Cloning is cheap and every clone drives the same registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::config::{
    ModuleCheckResult, PoolInfo, PoolOptions, SchedulerSettings, SessionSettings, SessionUpdate,
};
use crate::core::error::SchedulerError;
use crate::core::events::{EventBus, TaskEvent, TaskEventKind};
use crate::core::executor::run_task;
use crate::core::pool::Pool;
use crate::core::task::TaskRecord;
use crate::engine::ScriptEngine;
use crate::runtime::{Spawn, TokioSpawner};
use crate::util::clock::now_utc;

/// Name of the pool that always exists and cannot be removed.
pub const DEFAULT_POOL: &str = "default";

/// Interval between retention sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Bounded wait for reclaiming permits when a pool's ceiling shrinks.
const RESIZE_WAIT: Duration = Duration::from_secs(10);

fn normalize_pool_key(name: &str) -> String {
    name.trim().to_ascii_lowercase()
}

struct SchedulerInner<E: ScriptEngine, S: Spawn> {
    engine: Arc<E>,
    spawner: S,
    bus: EventBus<S>,
    pools: RwLock<HashMap<String, Arc<Pool<E>>>>,
    /// All configuration mutations serialize through this lock.
    config_gate: AsyncMutex<()>,
    disposed: AtomicBool,
}

impl<E: ScriptEngine, S: Spawn> SchedulerInner<E, S> {
    fn ensure_live(&self) -> Result<(), SchedulerError> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(SchedulerError::Disposed);
        }
        Ok(())
    }

    fn pool(&self, key: &str) -> Result<Arc<Pool<E>>, SchedulerError> {
        self.pools
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| SchedulerError::PoolNotFound(key.to_string()))
    }

    fn find_task(&self, id: Uuid) -> Option<(Arc<Pool<E>>, Arc<TaskRecord>)> {
        for pool in self.pools.read().values() {
            if let Some(task) = pool.get_task(id) {
                return Some((Arc::clone(pool), task));
            }
        }
        None
    }

    fn sweep_expired(&self) {
        let now = now_utc();
        let pools: Vec<Arc<Pool<E>>> = self.pools.read().values().cloned().collect();
        for pool in pools {
            let evicted = pool.evict_expired(now);
            if evicted > 0 {
                tracing::debug!(pool = %pool.name(), evicted, "retention sweep evicted tasks");
            }
        }
    }
}

/// The multi-pool background task scheduler.
pub struct Scheduler<E: ScriptEngine, S: Spawn = TokioSpawner> {
    inner: Arc<SchedulerInner<E, S>>,
}

impl<E: ScriptEngine, S: Spawn> Clone for Scheduler<E, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: ScriptEngine> Scheduler<E> {
    /// Create a scheduler on the current tokio runtime with a `default` pool.
    ///
    /// # Errors
    ///
    /// Propagates default-pool construction failures from the engine.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime (see
    /// [`TokioSpawner::current`]).
    pub fn new(engine: E) -> Result<Self, SchedulerError> {
        Self::with_spawner(engine, TokioSpawner::current())
    }
}

impl<E: ScriptEngine, S: Spawn + Clone + Send + Sync + 'static> Scheduler<E, S> {
    /// Create a scheduler dispatching background work through `spawner`.
    ///
    /// # Errors
    ///
    /// Propagates default-pool construction failures from the engine.
    pub fn with_spawner(engine: E, spawner: S) -> Result<Self, SchedulerError> {
        let engine = Arc::new(engine);
        let inner = Arc::new(SchedulerInner {
            engine: Arc::clone(&engine),
            spawner: spawner.clone(),
            bus: EventBus::new(spawner.clone()),
            pools: RwLock::new(HashMap::new()),
            config_gate: AsyncMutex::new(()),
            disposed: AtomicBool::new(false),
        });

        let default_pool = Pool::new(
            DEFAULT_POOL.to_string(),
            engine,
            SchedulerSettings::default(),
            SessionSettings::default(),
        )?;
        inner
            .pools
            .write()
            .insert(DEFAULT_POOL.to_string(), Arc::new(default_pool));

        // Retention sweep; exits when the scheduler is disposed or dropped.
        let weak = Arc::downgrade(&inner);
        spawner.spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                if inner.disposed.load(Ordering::SeqCst) {
                    break;
                }
                inner.sweep_expired();
            }
        });

        Ok(Self { inner })
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Submit a script for background execution and return its handle.
    ///
    /// The deadline, when given, is measured from the moment execution
    /// begins on a worker, not from submission.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidArgument`] for an empty script,
    /// [`SchedulerError::PoolNotFound`] for an unknown pool,
    /// [`SchedulerError::Disposed`] after shutdown.
    pub fn start_task(
        &self,
        script: &str,
        arguments: Vec<Value>,
        deadline: Option<Duration>,
        name: Option<String>,
        pool: Option<&str>,
    ) -> Result<Arc<TaskRecord>, SchedulerError> {
        self.inner.ensure_live()?;
        let script = script.trim();
        if script.is_empty() {
            return Err(SchedulerError::InvalidArgument(
                "script must not be empty".into(),
            ));
        }
        let key = normalize_pool_key(pool.unwrap_or(DEFAULT_POOL));
        let pool = self.inner.pool(&key)?;

        let task = Arc::new(TaskRecord::new(
            name,
            key,
            script.to_string(),
            arguments,
            deadline,
        ));
        pool.register_task(Arc::clone(&task));
        self.inner.bus.publish(&task, TaskEventKind::Created, None);
        tracing::info!(task_id = %task.id(), pool = %pool.name(), "task submitted");

        self.inner.spawner.spawn(run_task(
            pool,
            Arc::clone(&task),
            self.inner.bus.clone(),
            self.inner.spawner.clone(),
        ));
        Ok(task)
    }

    /// Look a task up by id across every pool.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Disposed`] after shutdown.
    pub fn get_task(&self, id: Uuid) -> Result<Option<Arc<TaskRecord>>, SchedulerError> {
        self.inner.ensure_live()?;
        Ok(self.inner.find_task(id).map(|(_, task)| task))
    }

    /// List tasks, optionally scoped to one pool and/or a set of ids,
    /// ordered by creation time.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::PoolNotFound`] for an unknown pool,
    /// [`SchedulerError::Disposed`] after shutdown.
    pub fn get_tasks(
        &self,
        pool: Option<&str>,
        ids: Option<&[Uuid]>,
    ) -> Result<Vec<Arc<TaskRecord>>, SchedulerError> {
        self.inner.ensure_live()?;
        let mut tasks = match pool {
            Some(name) => self.inner.pool(&normalize_pool_key(name))?.tasks(),
            None => self
                .inner
                .pools
                .read()
                .values()
                .flat_map(|pool| pool.tasks())
                .collect(),
        };
        if let Some(ids) = ids {
            tasks.retain(|task| ids.contains(&task.id()));
        }
        tasks.sort_by_key(|task| task.created_at());
        Ok(tasks)
    }

    /// Request cooperative stop of a task.
    ///
    /// Returns `true` when the task was still stoppable; a terminal task is
    /// a no-op returning `false`. The task transitions to `Cancelled` only
    /// after the engine actually returns.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Disposed`] after shutdown.
    pub fn stop_task(&self, task: &TaskRecord) -> Result<bool, SchedulerError> {
        self.inner.ensure_live()?;
        if task.is_finished() {
            return Ok(false);
        }
        tracing::info!(task_id = %task.id(), "stop requested");
        task.cancel_token().cancel();
        Ok(true)
    }

    /// Await a task's terminal state.
    ///
    /// Returns `true` once the task is terminal; `false` when `timeout`
    /// elapses first (the task keeps running; an elapsed wait never affects
    /// task state).
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Disposed`] after shutdown.
    pub async fn wait_task(
        &self,
        task: &TaskRecord,
        timeout: Option<Duration>,
    ) -> Result<bool, SchedulerError> {
        self.inner.ensure_live()?;
        let mut done = task.completion();
        match timeout {
            None => {
                let _ = done.wait_for(|finished| *finished).await;
                Ok(true)
            }
            Some(timeout) => {
                match tokio::time::timeout(timeout, done.wait_for(|finished| *finished)).await {
                    Ok(_) => Ok(true),
                    Err(_) => Ok(task.is_finished()),
                }
            }
        }
    }

    /// Remove terminal tasks from their pools' indexes.
    ///
    /// All-or-nothing: when any named task is still active the call fails
    /// and nothing is removed. Unknown ids are skipped. Returns the ids
    /// actually removed.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::TaskActive`] when a named task is not terminal,
    /// [`SchedulerError::Disposed`] after shutdown.
    pub fn remove_tasks(&self, ids: &[Uuid]) -> Result<Vec<Uuid>, SchedulerError> {
        self.inner.ensure_live()?;
        let mut resolved = Vec::new();
        for &id in ids {
            if let Some((pool, task)) = self.inner.find_task(id) {
                if !task.is_finished() {
                    return Err(SchedulerError::TaskActive {
                        id,
                        status: task.status(),
                    });
                }
                resolved.push((pool, id));
            }
        }
        let mut removed = Vec::new();
        for (pool, id) in resolved {
            if pool.remove_task(id).is_some() {
                removed.push(id);
            }
        }
        Ok(removed)
    }

    // ------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------

    /// Reconfigure a pool's worker bounds and retention.
    ///
    /// Growth releases new admission permits immediately; shrinking absorbs
    /// the delta within a bounded wait (see
    /// [`SchedulerError::ResizeTimeout`]).
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidArgument`] for `min < 1` or `max < min`,
    /// [`SchedulerError::PoolNotFound`], [`SchedulerError::ResizeTimeout`],
    /// [`SchedulerError::Disposed`].
    pub async fn configure(
        &self,
        pool: Option<&str>,
        min_workers: Option<usize>,
        max_workers: Option<usize>,
        retention: Option<Duration>,
    ) -> Result<SchedulerSettings, SchedulerError> {
        self.inner.ensure_live()?;
        let _guard = self.inner.config_gate.lock().await;
        let pool = self
            .inner
            .pool(&normalize_pool_key(pool.unwrap_or(DEFAULT_POOL)))?;
        let current = pool.settings();
        let requested = SchedulerSettings {
            min_workers: min_workers.unwrap_or(current.min_workers),
            max_workers: max_workers.unwrap_or(current.max_workers),
            retention: retention.unwrap_or(current.retention),
        };
        pool.apply_settings(requested.clone(), RESIZE_WAIT).await?;
        Ok(requested)
    }

    /// A pool's current scheduler settings.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::PoolNotFound`], [`SchedulerError::Disposed`].
    pub fn get_settings(&self, pool: Option<&str>) -> Result<SchedulerSettings, SchedulerError> {
        self.inner.ensure_live()?;
        Ok(self
            .inner
            .pool(&normalize_pool_key(pool.unwrap_or(DEFAULT_POOL)))?
            .settings())
    }

    /// Replace parts of a pool's session state and rebuild its worker bank.
    ///
    /// Permitted only while the pool has no active task; on failure nothing
    /// changes.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::PoolBusy`] while tasks are active,
    /// [`SchedulerError::MissingModules`] when a requested module fails its
    /// probe, [`SchedulerError::PoolNotFound`], [`SchedulerError::Disposed`].
    pub async fn configure_session(
        &self,
        pool: Option<&str>,
        update: SessionUpdate,
    ) -> Result<SessionSettings, SchedulerError> {
        self.inner.ensure_live()?;
        let _guard = self.inner.config_gate.lock().await;
        let pool = self
            .inner
            .pool(&normalize_pool_key(pool.unwrap_or(DEFAULT_POOL)))?;
        let merged = pool.session().merged(&update);
        pool.rebuild(merged)
    }

    /// A pool's current session settings.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::PoolNotFound`], [`SchedulerError::Disposed`].
    pub fn get_session_settings(
        &self,
        pool: Option<&str>,
    ) -> Result<SessionSettings, SchedulerError> {
        self.inner.ensure_live()?;
        Ok(self
            .inner
            .pool(&normalize_pool_key(pool.unwrap_or(DEFAULT_POOL)))?
            .session())
    }

    /// Probe whether a module is available to workers.
    #[must_use]
    pub fn check_module(&self, name: &str) -> ModuleCheckResult {
        self.inner.engine.probe_module(name)
    }

    // ------------------------------------------------------------------
    // Pools
    // ------------------------------------------------------------------

    /// Create a pool, or return the existing one after applying the given
    /// overrides through the regular update paths.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::InvalidArgument`] for an empty name or bad bounds,
    /// [`SchedulerError::MissingModules`] when a module fails its probe,
    /// plus the update-path errors when the pool already exists.
    pub async fn create_pool(
        &self,
        name: &str,
        options: PoolOptions,
    ) -> Result<PoolInfo, SchedulerError> {
        self.inner.ensure_live()?;
        let key = normalize_pool_key(name);
        if key.is_empty() {
            return Err(SchedulerError::InvalidArgument(
                "pool name must not be empty".into(),
            ));
        }
        let _guard = self.inner.config_gate.lock().await;

        if let Ok(existing) = self.inner.pool(&key) {
            if options.min_workers.is_some()
                || options.max_workers.is_some()
                || options.retention.is_some()
            {
                let current = existing.settings();
                let requested = SchedulerSettings {
                    min_workers: options.min_workers.unwrap_or(current.min_workers),
                    max_workers: options.max_workers.unwrap_or(current.max_workers),
                    retention: options.retention.unwrap_or(current.retention),
                };
                existing.apply_settings(requested, RESIZE_WAIT).await?;
            }
            if options.modules.is_some()
                || options.variables.is_some()
                || options.init_script.is_some()
            {
                let update = SessionUpdate {
                    modules: options.modules.clone(),
                    variables: options.variables.clone(),
                    init_script: options.init_script.clone().map(Some),
                };
                existing.rebuild(existing.session().merged(&update))?;
            }
            return Ok(existing.info());
        }

        let pool = Arc::new(Pool::new(
            key.clone(),
            Arc::clone(&self.inner.engine),
            options.scheduler_settings(),
            options.session_settings(),
        )?);
        let info = pool.info();
        self.inner.pools.write().insert(key, pool);
        Ok(info)
    }

    /// Destroy a non-default pool.
    ///
    /// With `force`, every active task's cancel signal is fired and the pool
    /// is disposed without waiting for anyone.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::DefaultPoolProtected`],
    /// [`SchedulerError::PoolNotFound`], [`SchedulerError::PoolBusy`] when
    /// tasks are active and `force` is not set,
    /// [`SchedulerError::Disposed`].
    pub fn remove_pool(&self, name: &str, force: bool) -> Result<(), SchedulerError> {
        self.inner.ensure_live()?;
        let key = normalize_pool_key(name);
        if key == DEFAULT_POOL {
            return Err(SchedulerError::DefaultPoolProtected);
        }
        let pool = self.inner.pool(&key)?;
        let active = pool.active_count();
        if active > 0 && !force {
            return Err(SchedulerError::PoolBusy { pool: key, active });
        }
        pool.cancel_active();
        self.inner.pools.write().remove(&key);
        tracing::info!(pool = %key, force, "pool removed");
        Ok(())
    }

    /// List pools (or one pool), sorted by name.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::PoolNotFound`] for an unknown `name`,
    /// [`SchedulerError::Disposed`].
    pub fn get_pools(&self, name: Option<&str>) -> Result<Vec<PoolInfo>, SchedulerError> {
        self.inner.ensure_live()?;
        match name {
            Some(name) => Ok(vec![self.inner.pool(&normalize_pool_key(name))?.info()]),
            None => {
                let mut infos: Vec<PoolInfo> = self
                    .inner
                    .pools
                    .read()
                    .values()
                    .map(|pool| pool.info())
                    .collect();
                infos.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(infos)
            }
        }
    }

    // ------------------------------------------------------------------
    // Events and lifecycle
    // ------------------------------------------------------------------

    /// Register a process-wide subscriber for every task lifecycle event.
    ///
    /// Subscribers run on the dispatch runtime, one fire-and-forget call per
    /// event, and must not block.
    pub fn subscribe<F>(&self, subscriber: F)
    where
        F: Fn(&TaskEvent) + Send + Sync + 'static,
    {
        self.inner.bus.subscribe(subscriber);
    }

    /// Dispose the scheduler: fire every active task's cancel signal, stop
    /// the retention sweep, and reject every subsequent operation.
    pub fn shutdown(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("scheduler disposing; cancelling active tasks");
        for pool in self.inner.pools.read().values() {
            pool.cancel_active();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::TaskStatus;
    use crate::engine::LocalEngine;

    fn scheduler() -> Scheduler<LocalEngine> {
        Scheduler::new(LocalEngine::default()).unwrap()
    }

    #[tokio::test]
    async fn default_pool_exists_and_cannot_be_removed() {
        let scheduler = scheduler();
        let pools = scheduler.get_pools(None).unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].name, DEFAULT_POOL);

        let err = scheduler.remove_pool("Default", false).unwrap_err();
        assert!(matches!(err, SchedulerError::DefaultPoolProtected));
    }

    #[tokio::test]
    async fn pool_names_are_case_insensitive() {
        let scheduler = scheduler();
        scheduler
            .create_pool("Reports", PoolOptions::default())
            .await
            .unwrap();
        assert_eq!(scheduler.get_pools(Some("REPORTS")).unwrap()[0].name, "reports");

        // Creating again applies overrides instead of duplicating.
        let info = scheduler
            .create_pool(
                "reports",
                PoolOptions {
                    max_workers: Some(7),
                    min_workers: Some(2),
                    ..PoolOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(info.max_workers, 7);
        assert_eq!(scheduler.get_pools(None).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn configure_rejects_bad_bounds() {
        let scheduler = scheduler();
        let err = scheduler
            .configure(None, Some(0), None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidArgument(_)));

        let err = scheduler
            .configure(None, Some(4), Some(2), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn empty_script_is_rejected_at_the_boundary() {
        let scheduler = scheduler();
        let err = scheduler
            .start_task("   ", Vec::new(), None, None, None)
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn unknown_pool_is_reported() {
        let scheduler = scheduler();
        let err = scheduler
            .start_task("emit x", Vec::new(), None, None, Some("nope"))
            .unwrap_err();
        assert!(matches!(err, SchedulerError::PoolNotFound(_)));
    }

    #[tokio::test]
    async fn retention_sweep_evicts_only_aged_terminal_tasks() {
        let scheduler = scheduler();
        scheduler
            .configure(None, None, None, Some(Duration::from_millis(10)))
            .await
            .unwrap();

        let task = scheduler
            .start_task("emit done", Vec::new(), None, None, None)
            .unwrap();
        assert!(scheduler
            .wait_task(&task, Some(Duration::from_secs(5)))
            .await
            .unwrap());
        assert_eq!(task.status(), TaskStatus::Completed);

        tokio::time::sleep(Duration::from_millis(30)).await;
        scheduler.inner.sweep_expired();
        assert!(scheduler.get_task(task.id()).unwrap().is_none());
    }

    #[tokio::test]
    async fn disposed_scheduler_rejects_operations() {
        let scheduler = scheduler();
        scheduler.shutdown();
        assert!(matches!(
            scheduler.start_task("emit x", Vec::new(), None, None, None),
            Err(SchedulerError::Disposed)
        ));
        assert!(matches!(
            scheduler.get_pools(None),
            Err(SchedulerError::Disposed)
        ));
        // Shutdown is idempotent.
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn shutdown_cancels_active_tasks() {
        let scheduler = scheduler();
        let task = scheduler
            .start_task("sleep 30000; emit late", Vec::new(), None, None, None)
            .unwrap();
        // Let it reach the worker.
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.shutdown();

        let mut done = task.completion();
        tokio::time::timeout(Duration::from_secs(5), done.wait_for(|d| *d))
            .await
            .expect("task settles after dispose")
            .expect("completion latch");
        assert_eq!(task.status(), TaskStatus::Cancelled);
    }
}
