//! Script-engine trait seam, module probe, and the built-in local engine.
//!
//! The scheduler core never talks to a concrete scripting engine; it drives
//! the [`ScriptEngine`] / [`WorkerContext`] traits. Embedders implement them
//! for their host engine. [`LocalEngine`] is the stock implementation: a
//! deterministic line-oriented interpreter that exercises every seam feature
//! and backs the test suite.

pub mod context;
pub mod local;
pub mod probe;

pub use context::{EngineError, ScriptEngine, StreamSink, WorkerContext, WorkerTemplate};
pub use local::LocalEngine;
pub use probe::{check, check_with_var, search_path, MODULE_PATH_VAR};
