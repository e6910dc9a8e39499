//! Utility modules for the backup manager.

pub mod errors;
pub mod logger;

pub use errors::{InstanceError, ManagerError, RunnerError, StoreError};
