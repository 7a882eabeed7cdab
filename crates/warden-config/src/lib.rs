//! # warden-config
//!
//! Configuration for the Warden runtime. Reads `warden.toml`, then applies
//! `WARDEN_*` environment overrides. Supports hot-reload via a filesystem
//! watcher.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    ConfigWarning, LoggingConfig, PipelineConfig, PolicyConfig, ScheduleConfig, StoreConfig,
    WardenConfig, WarningSeverity, WorkflowConfig,
};
