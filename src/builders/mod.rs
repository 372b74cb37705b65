//! Builders that turn session settings into worker templates.

pub mod template;

pub use template::{build_template, BASE_MODULES};
