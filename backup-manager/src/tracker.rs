//! Job tracking for running and finished backup jobs.
//!
//! One entry per backup set name holds the current [`JobRecord`], the
//! cancellation token of the run in progress and a bounded buffer of recent
//! output lines. Claiming a slot is atomic per name, so two runs of the same
//! set can never overlap.

use crate::executor::progress::parse_percent;
use crate::models::{JobRecord, JobStatus};
use crate::utils::errors::ManagerError;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Output lines kept in memory per backup set.
const MAX_BUFFERED_LINES: usize = 2000;

struct TrackedJob {
    record: JobRecord,
    cancel: Option<CancellationToken>,
    lines: VecDeque<String>,
}

impl TrackedJob {
    fn new(name: &str) -> Self {
        Self {
            record: JobRecord::idle(name),
            cancel: None,
            lines: VecDeque::new(),
        }
    }
}

/// Tracks backup jobs and provides the cancellation mechanism
#[derive(Clone, Default)]
pub struct JobTracker {
    jobs: Arc<DashMap<String, TrackedJob>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `name` as running and returns the token that cancels this run.
    ///
    /// Fails with [`ManagerError::AlreadyRunning`] if a run is in progress.
    pub fn try_begin(&self, name: &str, dry_run: bool) -> Result<CancellationToken, ManagerError> {
        let mut job = self
            .jobs
            .entry(name.to_string())
            .or_insert_with(|| TrackedJob::new(name));
        job.record.begin(dry_run)?;
        job.lines.clear();
        let token = CancellationToken::new();
        job.cancel = Some(token.clone());
        Ok(token)
    }

    /// Buffers an output line. Returns the new percentage if the line carried one.
    pub fn push_line(&self, name: &str, line: &str) -> Option<f32> {
        let mut job = self.jobs.get_mut(name)?;
        if job.lines.len() == MAX_BUFFERED_LINES {
            job.lines.pop_front();
        }
        job.lines.push_back(line.to_string());
        job.record.last_line = line.to_string();

        let percent = parse_percent(line)?;
        job.record.percent = percent;
        Some(percent)
    }

    /// Completes the running job for `name` and returns its final record.
    pub fn finish(&self, name: &str, exit_code: Option<i32>) -> Result<JobRecord, ManagerError> {
        let mut job = self
            .jobs
            .get_mut(name)
            .ok_or_else(|| ManagerError::UnknownSet(name.to_string()))?;
        job.record.finish(exit_code)?;
        job.cancel = None;
        Ok(job.record.clone())
    }

    /// Cancel a running job by its set name
    pub fn cancel(&self, name: &str) -> bool {
        match self.jobs.get(name) {
            Some(job) => match &job.cancel {
                Some(token) if job.record.is_running() => {
                    token.cancel();
                    true
                }
                _ => false,
            },
            None => false,
        }
    }

    /// Cancels every running job. Returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let mut count = 0;
        for job in self.jobs.iter() {
            if let (Some(token), true) = (&job.cancel, job.record.is_running()) {
                token.cancel();
                count += 1;
            }
        }
        count
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.jobs
            .get(name)
            .is_some_and(|job| job.record.is_running())
    }

    /// Get count of running jobs
    pub fn running_count(&self) -> usize {
        self.jobs
            .iter()
            .filter(|job| job.record.status == JobStatus::Running)
            .count()
    }

    pub fn get(&self, name: &str) -> Option<JobRecord> {
        self.jobs.get(name).map(|job| job.record.clone())
    }

    /// All known records, sorted by name.
    pub fn snapshot(&self) -> Vec<JobRecord> {
        let mut records: Vec<_> = self.jobs.iter().map(|job| job.record.clone()).collect();
        records.sort_by(|a, b| a.backup_set_name.cmp(&b.backup_set_name));
        records
    }

    /// Buffered output of the current or most recent run.
    pub fn lines(&self, name: &str) -> Vec<String> {
        self.jobs
            .get(name)
            .map(|job| job.lines.iter().cloned().collect())
            .unwrap_or_default()
    }
}
