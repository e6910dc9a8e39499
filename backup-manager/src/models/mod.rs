//! Data model: backup sets, settings and runtime job records.

pub mod backup_set;
pub mod job;
pub mod settings;

pub use backup_set::BackupSet;
pub use job::{JobRecord, JobStatus};
pub use settings::{AppSettings, GlobalSettings};
