//! Pool and session configuration structures and the DTO shapes exposed to
//! callers.
//!
//! Everything here is an immutable value object: the scheduler hands these
//! out as snapshots and accepts them as requested configuration. Validation
//! lives next to the types so every construction path shares one rule set.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Lower bound every pool keeps materialized.
pub const DEFAULT_MIN_WORKERS: usize = 1;

/// How long a completed task stays queryable by default.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(30 * 60);

/// Default worker ceiling: at least two, otherwise one per logical CPU.
#[must_use]
pub fn default_max_workers() -> usize {
    num_cpus::get().max(2)
}

/// Scheduler-level knobs of a single pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Minimum number of worker contexts kept materialized.
    pub min_workers: usize,
    /// Maximum number of worker contexts, and the admission ceiling.
    pub max_workers: usize,
    /// How long a completed task stays queryable before eviction.
    pub retention: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            min_workers: DEFAULT_MIN_WORKERS,
            max_workers: default_max_workers(),
            retention: DEFAULT_RETENTION,
        }
    }
}

impl SchedulerSettings {
    /// Validate worker bounds.
    ///
    /// # Errors
    ///
    /// Returns a human-readable description of the first violated rule.
    pub fn validate(&self) -> Result<(), String> {
        if self.min_workers < 1 {
            return Err("min_workers must be at least 1".into());
        }
        if self.max_workers < self.min_workers {
            return Err(format!(
                "max_workers ({}) must not be less than min_workers ({})",
                self.max_workers, self.min_workers
            ));
        }
        Ok(())
    }
}

/// Session state every worker context of a pool is seeded with.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSettings {
    /// Modules imported into each worker, in declaration order.
    pub modules: Vec<String>,
    /// Variables installed into the worker scope; names are case-insensitive.
    pub variables: HashMap<String, Value>,
    /// Optional prelude run exactly once per worker.
    pub init_script: Option<String>,
}

impl SessionSettings {
    /// Return a copy with module names deduplicated case-insensitively
    /// (declaration order preserved) and variable names lowercased.
    #[must_use]
    pub fn normalized(&self) -> Self {
        let mut seen = Vec::new();
        let mut modules = Vec::new();
        for module in &self.modules {
            let key = module.to_ascii_lowercase();
            if !seen.contains(&key) {
                seen.push(key);
                modules.push(module.clone());
            }
        }
        let variables = self
            .variables
            .iter()
            .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
            .collect();
        Self {
            modules,
            variables,
            init_script: self.init_script.clone(),
        }
    }

    /// Apply a partial update, returning the merged settings.
    #[must_use]
    pub fn merged(&self, update: &SessionUpdate) -> Self {
        Self {
            modules: update.modules.clone().unwrap_or_else(|| self.modules.clone()),
            variables: update
                .variables
                .clone()
                .unwrap_or_else(|| self.variables.clone()),
            init_script: match &update.init_script {
                Some(init) => init.clone(),
                None => self.init_script.clone(),
            },
        }
    }
}

/// Partial session-state update; `None` fields keep their current value.
///
/// `init_script` is doubly optional so an update can distinguish "leave the
/// init script alone" (`None`) from "clear it" (`Some(None)`).
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    /// Replacement module list.
    pub modules: Option<Vec<String>>,
    /// Replacement variable map.
    pub variables: Option<HashMap<String, Value>>,
    /// Replacement (or cleared) init script.
    pub init_script: Option<Option<String>>,
}

/// Everything a pool can be created with; `None` fields take defaults.
#[derive(Debug, Clone, Default)]
pub struct PoolOptions {
    /// Minimum worker count; defaults to [`DEFAULT_MIN_WORKERS`].
    pub min_workers: Option<usize>,
    /// Maximum worker count; defaults to [`default_max_workers`].
    pub max_workers: Option<usize>,
    /// Completed-task retention; defaults to [`DEFAULT_RETENTION`].
    pub retention: Option<Duration>,
    /// Modules imported into each worker.
    pub modules: Option<Vec<String>>,
    /// Variables installed into the worker scope.
    pub variables: Option<HashMap<String, Value>>,
    /// One-shot per-worker init script.
    pub init_script: Option<String>,
}

impl PoolOptions {
    pub(crate) fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            min_workers: self.min_workers.unwrap_or(DEFAULT_MIN_WORKERS),
            max_workers: self.max_workers.unwrap_or_else(default_max_workers),
            retention: self.retention.unwrap_or(DEFAULT_RETENTION),
        }
    }

    pub(crate) fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            modules: self.modules.clone().unwrap_or_default(),
            variables: self.variables.clone().unwrap_or_default(),
            init_script: self.init_script.clone(),
        }
    }
}

/// Point-in-time description of a pool for listing and inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolInfo {
    /// Pool name (lowercase-normalized key).
    pub name: String,
    /// Minimum worker count.
    pub min_workers: usize,
    /// Maximum worker count.
    pub max_workers: usize,
    /// Completed-task retention window.
    pub retention: Duration,
    /// Modules imported into each worker.
    pub modules: Vec<String>,
    /// One-shot per-worker init script, when configured.
    pub init_script: Option<String>,
    /// Tasks currently indexed by the pool (all states).
    pub task_count: usize,
    /// Tasks in a non-terminal state.
    pub active_count: usize,
}

/// Result of probing one module against the host module-search path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleCheckResult {
    /// Module name as requested.
    pub name: String,
    /// Whether the module was found.
    pub available: bool,
    /// Filesystem location of the first match.
    pub location: Option<PathBuf>,
    /// Human-readable diagnostic; on a miss it quotes the search path.
    pub message: String,
}
