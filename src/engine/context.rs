//! Engine contract: templates, worker contexts, and stream sinks.
//!
//! # Engine Contract
//!
//! Implementations must:
//! 1. Materialize worker contexts from a [`WorkerTemplate`] (modules imported
//!    in template order, variables installed into the worker scope)
//! 2. Persist worker-scope state across successive `run` calls on the same
//!    context, so a pool can reuse a warm worker between tasks
//! 3. Report captured items through the provided [`StreamSink`] in emission
//!    order
//! 4. Honor the stop token cooperatively: stop running as soon as practical
//!    and return, leaving the context reusable
//! 5. Reject an unrunnable script with [`EngineError::Rejected`] before
//!    executing any of it

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::ModuleCheckResult;
use crate::core::task::ProgressRecord;
use crate::engine::probe;

/// Errors raised by a script engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The script was refused before execution began.
    #[error("script rejected: {0}")]
    Rejected(String),
    /// The script ran and failed.
    #[error("script failed: {0}")]
    Script(String),
    /// Execution stopped cooperatively after the stop token fired.
    #[error("execution interrupted by stop signal")]
    Interrupted,
    /// The worker context itself is unusable.
    #[error("worker context error: {0}")]
    Context(String),
}

/// Canonical seeded initial state from which workers are materialized.
///
/// Built by [`crate::builders::build_template`] after module validation; the
/// scheduler treats it as opaque and immutable.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerTemplate {
    modules: Vec<String>,
    variables: HashMap<String, Value>,
    init_script: Option<String>,
}

impl WorkerTemplate {
    pub(crate) fn new(
        modules: Vec<String>,
        variables: HashMap<String, Value>,
        init_script: Option<String>,
    ) -> Self {
        Self {
            modules,
            variables,
            init_script,
        }
    }

    /// Modules to import, base modules first, in declaration order.
    #[must_use]
    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    /// Variables to install into the worker scope (names lowercased).
    #[must_use]
    pub fn variables(&self) -> &HashMap<String, Value> {
        &self.variables
    }

    /// One-shot per-worker init script, when configured.
    #[must_use]
    pub fn init_script(&self) -> Option<&str> {
        self.init_script.as_deref()
    }
}

/// Receiver for items a running script emits.
///
/// The executor wires one of these per task; implementations append to the
/// task's stream buffers and publish progress events. Sinks must not block.
pub trait StreamSink: Send + Sync {
    /// An output item was emitted.
    fn output(&self, item: Value);
    /// An error item was emitted.
    fn error(&self, item: Value);
    /// A progress record was emitted.
    fn progress(&self, record: ProgressRecord);
}

/// A reusable script-engine worker instance.
///
/// A context is checked out to exactly one task at a time; it is not itself
/// thread-safe and the pool enforces single ownership.
#[async_trait]
pub trait WorkerContext: Send + 'static {
    /// Run a script with positional arguments.
    ///
    /// Captured items flow through `sink` in emission order. When `stop`
    /// fires the engine must wind down cooperatively and return (typically
    /// [`EngineError::Interrupted`]); the caller classifies the outcome from
    /// the stop cause, not from the returned error.
    ///
    /// # Errors
    ///
    /// [`EngineError::Rejected`] for an unrunnable script (before any side
    /// effect), [`EngineError::Script`] for a runtime failure,
    /// [`EngineError::Interrupted`] after a stop.
    async fn run(
        &mut self,
        script: &str,
        arguments: &[Value],
        sink: &dyn StreamSink,
        stop: &CancellationToken,
    ) -> Result<(), EngineError>;
}

/// Factory for worker contexts, plus module discovery.
pub trait ScriptEngine: Send + Sync + 'static {
    /// Concrete worker context type this engine materializes.
    type Context: WorkerContext;

    /// Materialize a fresh worker context from a template.
    ///
    /// # Errors
    ///
    /// [`EngineError::Context`] when the context cannot be built (for
    /// example, a module import fails despite an earlier successful probe).
    fn create_context(&self, template: &WorkerTemplate) -> Result<Self::Context, EngineError>;

    /// Probe whether a module is available to workers of this engine.
    ///
    /// The default consults the process module-search path
    /// ([`probe::MODULE_PATH_VAR`]).
    fn probe_module(&self, name: &str) -> ModuleCheckResult {
        probe::check(name)
    }

    /// The search path consulted by [`Self::probe_module`], verbatim, for
    /// inclusion in diagnostics.
    fn module_search_path(&self) -> String {
        probe::search_path(probe::MODULE_PATH_VAR)
    }
}
