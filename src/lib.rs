//! # Scriptpool
//!
//! A multi-pool background task scheduler for embedded script engines.
//!
//! Callers submit units of work (a script body plus positional arguments and
//! an optional per-task deadline) and receive a task handle that can be
//! polled, awaited, drained of captured output, cancelled, or removed. Each
//! task is dispatched to a named execution pool that owns a bounded bank of
//! reusable script-engine worker contexts pre-seeded with configurable
//! session state (imported modules, preset variables, a one-shot per-worker
//! init routine).
//!
//! ## Core Responsibilities
//!
//! - **Pool lifecycle**: named pools with min/max worker bounds, created on
//!   demand and rebuilt atomically when session state changes
//! - **Worker reuse**: engine contexts persist across tasks, so expensive
//!   module imports and init routines run once per worker, not once per task
//! - **Admission control**: a per-pool gate bounds concurrently running tasks
//!   to the pool's worker ceiling
//! - **Task state machine**: forward-only transitions with a firing-order
//!   tie-break between user cancellation and deadline expiry
//! - **Stream capture**: ordered, drainable output / error / progress buffers
//!   per task, with a last-progress snapshot
//! - **Retention cleanup**: completed tasks stay queryable for a per-pool
//!   retention window, then are evicted by a background sweep
//! - **Lifecycle events**: fire-and-forget fan-out of task transitions to
//!   registered subscribers
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use scriptpool::core::Scheduler;
//! use scriptpool::engine::LocalEngine;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let scheduler = Scheduler::new(LocalEngine::default())?;
//! let task = scheduler.start_task("emit hello", Vec::new(), None, None, None)?;
//! scheduler.wait_task(&task, None).await?;
//! println!("{:?}", task.receive_output(false));
//! # Ok(())
//! # }
//! ```
//!
//! The host scripting engine is reached through the [`engine::ScriptEngine`]
//! trait seam; [`engine::LocalEngine`] is the built-in implementation used by
//! the test suite and suitable for demos.

#![deny(warnings)]
#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Core scheduling: tasks, pools, executor, scheduler façade, events.
pub mod core;
/// Configuration models and public DTO contracts.
pub mod config;
/// Builders that turn session settings into worker templates.
pub mod builders;
/// Script-engine trait seam, module probe, and the built-in local engine.
pub mod engine;
/// Runtime adapters for background dispatch.
pub mod runtime;
/// Shared utilities.
pub mod util;
