//! Module availability probe.
//!
//! A pure lookup against the host module-search-path environment variable:
//! no side effects, no shared state. Each entry of the path is checked in
//! order and the first match wins. A module is considered present when an
//! entry contains either a `<name>` directory or a `<name>.mod` file.

use std::env;
use std::path::{Path, PathBuf};

use crate::config::ModuleCheckResult;

/// Environment variable listing the directories searched for modules.
pub const MODULE_PATH_VAR: &str = "SCRIPTPOOL_MODULE_PATH";

/// Probe a module against the default search-path variable.
#[must_use]
pub fn check(name: &str) -> ModuleCheckResult {
    check_with_var(name, MODULE_PATH_VAR)
}

/// Current value of a search-path variable, verbatim ("" when unset).
#[must_use]
pub fn search_path(var: &str) -> String {
    env::var(var).unwrap_or_default()
}

/// Probe a module against an explicit search-path variable.
#[must_use]
pub fn check_with_var(name: &str, var: &str) -> ModuleCheckResult {
    let raw = search_path(var);
    let entries: Vec<PathBuf> = env::split_paths(&raw)
        .filter(|entry| !entry.as_os_str().is_empty())
        .collect();

    for entry in &entries {
        if let Some(location) = match_in_entry(entry, name) {
            return ModuleCheckResult {
                name: name.to_string(),
                available: true,
                location: Some(location.clone()),
                message: format!("found at `{}`", location.display()),
            };
        }
    }

    ModuleCheckResult {
        name: name.to_string(),
        available: false,
        location: None,
        message: format!(
            "no match in {} search path entr{} (search path `{raw}` from ${var})",
            entries.len(),
            if entries.len() == 1 { "y" } else { "ies" },
        ),
    }
}

fn match_in_entry(entry: &Path, name: &str) -> Option<PathBuf> {
    // Exact casing first, then lowercase for hosts with case-insensitive
    // module naming conventions.
    for candidate in [name.to_string(), name.to_ascii_lowercase()] {
        let dir = entry.join(&candidate);
        if dir.is_dir() {
            return Some(dir);
        }
        let file = entry.join(format!("{candidate}.mod"));
        if file.is_file() {
            return Some(file);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_module_message_quotes_the_search_path() {
        let result = check_with_var("definitely-absent", "SCRIPTPOOL_TEST_UNSET_PATH");
        assert!(!result.available);
        assert!(result.location.is_none());
        assert!(result.message.contains("SCRIPTPOOL_TEST_UNSET_PATH"));
    }

    #[test]
    fn probe_finds_module_directory_and_mod_file() {
        let root = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir(root.path().join("net")).expect("module dir");
        std::fs::write(root.path().join("data.mod"), b"").expect("module file");

        // Unique variable per test; the probe reads the environment directly.
        let var = "SCRIPTPOOL_PROBE_TEST_PATH";
        std::env::set_var(var, root.path());

        let dir_hit = check_with_var("net", var);
        assert!(dir_hit.available);
        assert_eq!(dir_hit.location, Some(root.path().join("net")));

        let file_hit = check_with_var("data", var);
        assert!(file_hit.available);
        assert_eq!(file_hit.location, Some(root.path().join("data.mod")));

        let miss = check_with_var("ghost", var);
        assert!(!miss.available);
        assert!(miss.message.contains("1 search path entry"));

        std::env::remove_var(var);
    }
}
