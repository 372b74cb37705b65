//! Wall-clock helpers.

use chrono::{DateTime, Utc};

/// Current wall-clock time in UTC.
///
/// All task timestamps (`created_at`, `started_at`, `completed_at`) and event
/// timestamps come from this single helper so tests can reason about one
/// clock source.
#[must_use]
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}
