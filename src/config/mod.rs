//! Configuration models and public DTO contracts.

pub mod settings;

pub use settings::{
    default_max_workers, ModuleCheckResult, PoolInfo, PoolOptions, SchedulerSettings,
    SessionSettings, SessionUpdate, DEFAULT_MIN_WORKERS, DEFAULT_RETENTION,
};
