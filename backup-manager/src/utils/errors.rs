//! Error types for the backup manager.

use crate::models::JobStatus;
use thiserror::Error;

/// Errors raised while reading, validating or writing the configuration file.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Validation(String),

    #[error("A backup set named '{0}' already exists")]
    DuplicateName(String),

    #[error("No backup set named '{0}'")]
    NotFound(String),
}

/// Errors raised while launching or talking to the external sync tool.
#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("{0} not found. Install rclone and make sure it is on PATH")]
    ToolNotFound(String),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by the job tracker and orchestrator.
#[derive(Error, Debug)]
pub enum ManagerError {
    #[error("Backup '{0}' is already running")]
    AlreadyRunning(String),

    #[error("No backup set named '{0}'")]
    UnknownSet(String),

    #[error("Backup '{name}' cannot move from {from} to {to}")]
    InvalidTransition {
        name: String,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Errors raised by the single-instance guard.
#[derive(Error, Debug)]
pub enum InstanceError {
    #[error("Another instance (pid {0}) is already running backups for this configuration")]
    Held(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
