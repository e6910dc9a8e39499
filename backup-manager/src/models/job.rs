use crate::utils::errors::ManagerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Idle,
    Running,
    Success,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        };
        f.pad(s)
    }
}

/// Runtime state of one backup set's most recent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub backup_set_name: String,
    pub run_id: Option<Uuid>,
    pub status: JobStatus,
    pub dry_run: bool,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub percent: f32,
    pub last_line: String,
}

impl JobRecord {
    pub fn idle(name: impl Into<String>) -> Self {
        Self {
            backup_set_name: name.into(),
            run_id: None,
            status: JobStatus::Idle,
            dry_run: false,
            start_time: None,
            end_time: None,
            exit_code: None,
            percent: 0.0,
            last_line: String::new(),
        }
    }

    /// Moves the record to `running`, clearing everything from the previous run.
    pub fn begin(&mut self, dry_run: bool) -> Result<(), ManagerError> {
        if self.status == JobStatus::Running {
            return Err(ManagerError::AlreadyRunning(self.backup_set_name.clone()));
        }
        self.run_id = Some(Uuid::new_v4());
        self.status = JobStatus::Running;
        self.dry_run = dry_run;
        self.start_time = Some(Utc::now());
        self.end_time = None;
        self.exit_code = None;
        self.percent = 0.0;
        self.last_line = "Starting...".to_string();
        Ok(())
    }

    /// Moves a running record to `success` (exit code 0) or `failed`.
    ///
    /// `exit_code` is `None` when the process never ran, was cancelled or was
    /// killed by a signal.
    pub fn finish(&mut self, exit_code: Option<i32>) -> Result<JobStatus, ManagerError> {
        let to = if exit_code == Some(0) {
            JobStatus::Success
        } else {
            JobStatus::Failed
        };
        if self.status != JobStatus::Running {
            return Err(ManagerError::InvalidTransition {
                name: self.backup_set_name.clone(),
                from: self.status,
                to,
            });
        }
        self.status = to;
        self.exit_code = exit_code;
        self.end_time = Some(Utc::now());
        if to == JobStatus::Success {
            self.percent = 100.0;
        }
        Ok(to)
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        Some(self.end_time? - self.start_time?)
    }
}
