//! Session-state builder: validate settings, then build a worker template.
//!
//! Validation is all-or-nothing. Every configured module is probed before a
//! template is assembled; any miss fails the call with a structured error
//! listing each missing module and the search path, and no state is touched.

use crate::config::SessionSettings;
use crate::core::error::SchedulerError;
use crate::engine::{ScriptEngine, WorkerTemplate};

/// Built-in modules every worker imports before the configured ones: the
/// path and utility verb sets the stock script surface depends on.
pub const BASE_MODULES: [&str; 2] = ["path", "util"];

/// Build a worker template from session settings.
///
/// Module names are deduplicated case-insensitively in declaration order and
/// probed through the engine; variable names are lowercased so they resolve
/// case-insensitively inside workers.
///
/// # Errors
///
/// [`SchedulerError::MissingModules`] when any configured module fails its
/// availability probe. Base modules are engine built-ins and are not probed.
pub fn build_template<E: ScriptEngine>(
    engine: &E,
    session: &SessionSettings,
) -> Result<WorkerTemplate, SchedulerError> {
    let normalized = session.normalized();

    let missing: Vec<_> = normalized
        .modules
        .iter()
        .map(|module| engine.probe_module(module))
        .filter(|check| !check.available)
        .collect();
    if !missing.is_empty() {
        tracing::warn!(
            missing = missing.len(),
            "session rejected: modules unavailable"
        );
        return Err(SchedulerError::MissingModules {
            missing,
            search_path: engine.module_search_path(),
        });
    }

    let mut modules: Vec<String> = BASE_MODULES.iter().map(ToString::to_string).collect();
    modules.extend(normalized.modules.iter().cloned());

    Ok(WorkerTemplate::new(
        modules,
        normalized.variables,
        normalized.init_script,
    ))
}
