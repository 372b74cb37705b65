//! Runtime adapters for background dispatch.
//!
//! The scheduler never spawns onto a runtime directly; everything that runs
//! in the background (the per-task run loop, event fan-out, the retention
//! sweep) goes through the [`Spawn`] seam. [`TokioSpawner`] is the stock
//! implementation.

use std::future::Future;
use std::sync::Arc;

/// Abstraction for spawning background work on a runtime.
pub trait Spawn {
    /// Spawn a future to run to completion in the background.
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static;
}

/// Tokio-based spawner bound to a runtime handle.
#[derive(Clone)]
pub struct TokioSpawner {
    handle: Arc<tokio::runtime::Handle>,
}

impl TokioSpawner {
    /// Create a spawner from an explicit tokio runtime handle.
    #[must_use]
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self {
            handle: Arc::new(handle),
        }
    }

    /// Create a spawner bound to the runtime of the calling context.
    ///
    /// # Panics
    ///
    /// Panics when called outside a tokio runtime.
    #[must_use]
    pub fn current() -> Self {
        Self::new(tokio::runtime::Handle::current())
    }

    /// Create a spawner backed by a fresh multi-threaded runtime.
    ///
    /// # Errors
    ///
    /// Returns the I/O error from the runtime builder.
    pub fn with_worker_threads(worker_threads: usize) -> Result<Self, std::io::Error> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(worker_threads)
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        // The runtime must outlive every task spawned through the handle; it
        // is intentionally never dropped.
        std::mem::forget(runtime);
        Ok(Self::new(handle))
    }
}

impl Spawn for TokioSpawner {
    fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(fut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn with_worker_threads_spawns_onto_its_own_runtime() {
        let spawner = TokioSpawner::with_worker_threads(1).expect("runtime");
        let (tx, rx) = mpsc::channel();
        spawner.spawn(async move {
            tx.send(42u32).expect("send");
        });
        let value = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("spawned future ran");
        assert_eq!(value, 42);
    }

    #[test]
    fn clones_share_the_same_runtime_handle() {
        let spawner = TokioSpawner::with_worker_threads(1).expect("runtime");
        let clone = spawner.clone();
        let (tx, rx) = mpsc::channel();
        clone.spawn(async move {
            tx.send(()).expect("send");
        });
        rx.recv_timeout(Duration::from_secs(5))
            .expect("spawned future ran");
    }
}
