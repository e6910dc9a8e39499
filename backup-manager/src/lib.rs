//! Backup Manager Library
//!
//! Runs rclone-backed folder backups described by a JSON list of backup sets,
//! tracks their status and re-runs them on a fixed interval.

pub mod config;
pub mod daemon;
pub mod events;
pub mod executor;
pub mod models;
pub mod services;
pub mod store;
pub mod tracker;
pub mod utils;

// Re-export commonly used types
pub use config::RuntimeConfig;
pub use models::{BackupSet, GlobalSettings, JobRecord, JobStatus};
pub use services::orchestrator::BackupManager;
pub use store::{BackupConfig, ConfigStore};
pub use utils::errors::{ManagerError, RunnerError, StoreError};
