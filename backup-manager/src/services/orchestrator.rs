use crate::events::{EventBus, JobEvent};
use crate::executor::log::JobLog;
use crate::executor::{build_args, ExitState, RcloneRunner, RunOptions};
use crate::models::{BackupSet, GlobalSettings, JobRecord, JobStatus};
use crate::store::BackupConfig;
use crate::tracker::JobTracker;
use crate::utils::errors::{ManagerError, RunnerError};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Runs backup jobs and keeps the shared runtime state they update.
pub struct BackupManager {
    runner: RcloneRunner,
    log_dir: PathBuf,
    tracker: JobTracker,
    events: EventBus,
    last_runs: DashMap<String, DateTime<Utc>>,
    /// Lossless receivers of every finished record
    completion_sinks: DashMap<u64, mpsc::UnboundedSender<JobRecord>>,
    next_sink_id: AtomicU64,
    tool_missing_reported: AtomicBool,
}

/// Jobs started by one "run all" pass and the sets that were left out.
#[derive(Default)]
pub struct RunAllReport {
    pub started: Vec<(String, JoinHandle<Result<JobRecord, ManagerError>>)>,
    /// Sets whose previous run had not finished
    pub skipped_running: Vec<String>,
    /// Sets missing a local or remote path
    pub skipped_invalid: Vec<String>,
}

impl RunAllReport {
    pub fn started_names(&self) -> Vec<&str> {
        self.started.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Waits for every started job and returns their final records.
    pub async fn wait(self) -> Vec<JobRecord> {
        let mut records = Vec::with_capacity(self.started.len());
        for (name, handle) in self.started {
            match handle.await {
                Ok(Ok(record)) => records.push(record),
                Ok(Err(e)) => tracing::error!(job = %name, error = %e, "Backup job ended in an invalid state"),
                Err(e) => tracing::error!(job = %name, error = %e, "Backup task panicked"),
            }
        }
        records
    }
}

impl BackupManager {
    pub fn new(runner: RcloneRunner, log_dir: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            log_dir: log_dir.into(),
            tracker: JobTracker::new(),
            events: EventBus::new(),
            last_runs: DashMap::new(),
            completion_sinks: DashMap::new(),
            next_sink_id: AtomicU64::new(0),
            tool_missing_reported: AtomicBool::new(false),
        }
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.tracker
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn log_dir(&self) -> &std::path::Path {
        &self.log_dir
    }

    /// Receives the final record of every job that finishes from now on.
    ///
    /// Unlike [`events`](Self::events) nothing is dropped when the receiver
    /// falls behind, so hosts persist last-run times from here.
    pub fn subscribe_completions(&self) -> mpsc::UnboundedReceiver<JobRecord> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_sink_id.fetch_add(1, Ordering::Relaxed);
        self.completion_sinks.insert(id, tx);
        rx
    }

    /// Loads persisted last-run times so first-run detection survives restarts.
    pub fn seed_last_runs(&self, sets: &[BackupSet]) {
        for set in sets {
            if let Some(at) = set.last_run {
                self.last_runs
                    .entry(set.name.clone())
                    .and_modify(|current| *current = (*current).max(at))
                    .or_insert(at);
            }
        }
    }

    pub fn last_run(&self, name: &str) -> Option<DateTime<Utc>> {
        self.last_runs.get(name).map(|at| *at)
    }

    /// Runs one backup set to completion on the current task.
    pub async fn run_backup_job(
        &self,
        set: BackupSet,
        settings: GlobalSettings,
        dry_run: bool,
    ) -> Result<JobRecord, ManagerError> {
        let cancel = self.tracker.try_begin(&set.name, dry_run)?;
        self.run_claimed(set, settings, dry_run, cancel).await
    }

    /// Claims the set's running slot, then runs it on a new task.
    ///
    /// The claim happens before this returns, so a second call for the same
    /// set fails with [`ManagerError::AlreadyRunning`] even if the first task
    /// has not been polled yet.
    pub fn spawn_backup_job(
        self: &Arc<Self>,
        set: BackupSet,
        settings: GlobalSettings,
        dry_run: bool,
    ) -> Result<JoinHandle<Result<JobRecord, ManagerError>>, ManagerError> {
        let cancel = self.tracker.try_begin(&set.name, dry_run)?;
        let manager = Arc::clone(self);
        Ok(tokio::spawn(async move {
            manager.run_claimed(set, settings, dry_run, cancel).await
        }))
    }

    /// Starts every set in `config` that is not already running.
    pub fn run_all(self: &Arc<Self>, config: &BackupConfig, dry_run: bool) -> RunAllReport {
        self.run_sets(&config.backup_sets, &config.settings, dry_run)
    }

    pub fn run_sets(
        self: &Arc<Self>,
        sets: &[BackupSet],
        settings: &GlobalSettings,
        dry_run: bool,
    ) -> RunAllReport {
        let mut report = RunAllReport::default();
        for set in sets {
            if !set.is_runnable() {
                tracing::warn!(job = %set.name, "Skipping backup: missing local or remote path");
                report.skipped_invalid.push(set.name.clone());
                continue;
            }
            match self.spawn_backup_job(set.clone(), settings.clone(), dry_run) {
                Ok(handle) => report.started.push((set.name.clone(), handle)),
                Err(ManagerError::AlreadyRunning(name)) => {
                    tracing::info!(job = %name, "Skipping backup: previous run still in progress");
                    report.skipped_running.push(name);
                }
                Err(e) => {
                    tracing::error!(job = %set.name, error = %e, "Failed to start backup");
                    report.skipped_invalid.push(set.name.clone());
                }
            }
        }
        tracing::info!(
            started = report.started.len(),
            skipped_running = report.skipped_running.len(),
            skipped_invalid = report.skipped_invalid.len(),
            dry_run,
            "Backup pass dispatched"
        );
        report
    }

    pub fn cancel(&self, name: &str) -> bool {
        let cancelled = self.tracker.cancel(name);
        if cancelled {
            tracing::info!(job = %name, "Cancellation requested");
        }
        cancelled
    }

    pub fn cancel_all(&self) -> usize {
        let count = self.tracker.cancel_all();
        if count > 0 {
            tracing::info!(count, "Cancellation requested for all running backups");
        }
        count
    }

    async fn run_claimed(
        &self,
        set: BackupSet,
        settings: GlobalSettings,
        dry_run: bool,
        cancel: CancellationToken,
    ) -> Result<JobRecord, ManagerError> {
        let name = set.name.clone();
        let opts = RunOptions {
            dry_run,
            first_run: self.last_run(&name).is_none(),
        };
        let args = build_args(&set, &settings, opts);
        let started_at = Utc::now();
        let clock = std::time::Instant::now();

        if let Some(record) = self.tracker.get(&name) {
            if let Some(run_id) = record.run_id {
                self.events.publish(JobEvent::Started {
                    name: name.clone(),
                    run_id,
                    dry_run,
                });
            }
        }
        tracing::info!(
            job = %name,
            local = %set.local,
            remote = %set.target_remote(),
            dry_run,
            first_run = opts.first_run,
            "Starting backup"
        );

        let (exit_code, failure) = match JobLog::open(&self.log_dir, &name) {
            Ok(mut log) => {
                if let Err(e) = log.started(started_at, &self.runner.command_line(&args), dry_run) {
                    tracing::warn!(job = %name, error = %e, "Failed to write job log");
                }
                let (exit_code, failure) = self.execute(&name, &args, &cancel, &mut log).await;
                if let Some(reason) = &failure {
                    let _ = log.write_line(&format!("ERROR: {reason}"));
                }
                let status = if exit_code == Some(0) {
                    JobStatus::Success
                } else {
                    JobStatus::Failed
                };
                if let Err(e) = log.finished(Utc::now(), clock.elapsed(), status, exit_code) {
                    tracing::warn!(job = %name, error = %e, "Failed to write job log");
                }
                (exit_code, failure)
            }
            Err(e) => {
                tracing::error!(job = %name, dir = %self.log_dir.display(), error = %e, "Cannot open job log");
                (None, Some(format!("cannot open job log: {e}")))
            }
        };

        if let Some(reason) = &failure {
            self.tracker.push_line(&name, &format!("ERROR: {reason}"));
        }
        let record = self.tracker.finish(&name, exit_code)?;
        let finished_at = record.end_time.unwrap_or_else(Utc::now);
        if !dry_run {
            self.last_runs.insert(name.clone(), finished_at);
        }
        // Dropped receivers unregister themselves here
        self.completion_sinks
            .retain(|_, tx| tx.send(record.clone()).is_ok());

        self.events.publish(JobEvent::Finished {
            name: name.clone(),
            status: record.status,
            exit_code,
            dry_run,
            finished_at,
        });

        let elapsed_ms = clock.elapsed().as_millis() as u64;
        match &failure {
            None if record.exit_code == Some(0) => {
                tracing::info!(job = %name, elapsed_ms, "Backup completed")
            }
            None => tracing::warn!(job = %name, exit_code = ?exit_code, "Backup failed"),
            Some(reason) => tracing::warn!(job = %name, reason = %reason, "Backup failed"),
        }

        Ok(record)
    }

    /// Runs rclone, mirroring each output line into the log, tracker and bus.
    async fn execute(
        &self,
        name: &str,
        args: &[String],
        cancel: &CancellationToken,
        log: &mut JobLog,
    ) -> (Option<i32>, Option<String>) {
        let tracker = &self.tracker;
        let events = &self.events;
        let mut log_failed = false;
        let mut on_line = |line: &str| {
            if let Err(e) = log.write_line(line) {
                if !log_failed {
                    tracing::warn!(job = %name, error = %e, "Failed to write job log");
                    log_failed = true;
                }
            }
            if let Some(percent) = tracker.push_line(name, line) {
                events.publish(JobEvent::Progress {
                    name: name.to_string(),
                    percent,
                });
            }
            events.publish(JobEvent::Output {
                name: name.to_string(),
                line: line.to_string(),
            });
        };

        match self.runner.run(args, cancel, &mut on_line).await {
            Ok(ExitState::Exited(code)) => (Some(code), None),
            Ok(ExitState::Signalled) => (None, Some("rclone was terminated by a signal".into())),
            Ok(ExitState::Cancelled) => (None, Some("backup cancelled".into())),
            Err(e @ RunnerError::ToolNotFound(_)) => {
                if !self.tool_missing_reported.swap(true, Ordering::SeqCst) {
                    tracing::warn!(program = %self.runner.program().display(), "{e}");
                }
                (None, Some(e.to_string()))
            }
            Err(e) => (None, Some(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager_with(dir: &TempDir, program: &str, flags: Vec<String>) -> Arc<BackupManager> {
        let runner = RcloneRunner::new(program).with_global_flags(flags);
        Arc::new(BackupManager::new(runner, dir.path().join("logs")))
    }

    #[test]
    fn test_seed_last_runs_keeps_latest() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(&dir, "rclone", vec![]);
        let older = Utc::now() - chrono::Duration::hours(1);
        let newer = Utc::now();

        let mut a = BackupSet::new("Docs", "/a", "r:a");
        a.last_run = Some(newer);
        manager.seed_last_runs(&[a.clone()]);
        a.last_run = Some(older);
        manager.seed_last_runs(&[a, BackupSet::new("Fresh", "/b", "r:b")]);

        assert_eq!(manager.last_run("Docs"), Some(newer));
        assert_eq!(manager.last_run("Fresh"), None);
    }

    #[tokio::test]
    async fn test_missing_tool_marks_job_failed() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(&dir, "/nonexistent/rclone-missing", vec![]);
        let set = BackupSet::new("Docs", "/home/u/Documents", "gdrive:Docs");

        let record = manager
            .run_backup_job(set.clone(), GlobalSettings::default(), false)
            .await
            .unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(record.end_time.is_some());
        assert!(record.last_line.contains("not found"));

        // Reported once, but every run still fails cleanly
        let record = manager
            .run_backup_job(set, GlobalSettings::default(), false)
            .await
            .unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert!(manager.tool_missing_reported.load(Ordering::SeqCst));

        let log = std::fs::read_to_string(dir.path().join("logs").join("Docs.log")).unwrap();
        assert!(log.contains("ERROR:"));
        assert!(log.contains("Backup finished: failed"));
    }

    #[tokio::test]
    async fn test_run_all_skips_invalid_sets() {
        let dir = TempDir::new().unwrap();
        let manager = manager_with(&dir, "/nonexistent/rclone-missing", vec![]);
        let config = BackupConfig {
            backup_sets: vec![
                BackupSet::new("Docs", "/a", "r:a"),
                BackupSet::new("Broken", "", "r:b"),
            ],
            ..BackupConfig::default()
        };

        let report = manager.run_all(&config, false);
        assert_eq!(report.started_names(), ["Docs"]);
        assert_eq!(report.skipped_invalid, ["Broken"]);
        let records = report.wait().await;
        assert_eq!(records.len(), 1);
    }

    #[cfg(unix)]
    mod fake_tool {
        use super::*;
        use std::time::Duration;

        /// Runs `script` through `/bin/sh`; the rclone arguments follow it.
        fn sh_manager(dir: &TempDir, script: &str) -> Arc<BackupManager> {
            let path = dir.path().join("fake-rclone.sh");
            std::fs::write(&path, script).unwrap();
            manager_with(dir, "/bin/sh", vec![path.display().to_string()])
        }

        fn docs() -> BackupSet {
            BackupSet::new("Docs", "/home/u/Documents", "gdrive:Backups/Documents")
        }

        #[tokio::test]
        async fn test_failed_exit_keeps_stderr_in_log() {
            let dir = TempDir::new().unwrap();
            let manager = sh_manager(&dir, "echo 'ERROR : quota exceeded' >&2\nexit 1\n");
            let mut rx = manager.events().subscribe();

            let record = manager
                .run_backup_job(docs(), GlobalSettings::default(), false)
                .await
                .unwrap();

            assert_eq!(record.status, JobStatus::Failed);
            assert_eq!(record.exit_code, Some(1));
            assert!(record.end_time.is_some());

            let log = std::fs::read_to_string(dir.path().join("logs").join("Docs.log")).unwrap();
            assert!(log.contains("ERROR : quota exceeded"));
            assert!(log.contains("exit code: 1"));
            assert_eq!(manager.tracker().lines("Docs"), ["ERROR : quota exceeded"]);

            // Started precedes Finished on the bus
            let mut saw_started = false;
            loop {
                match rx.recv().await.unwrap() {
                    JobEvent::Started { .. } => saw_started = true,
                    JobEvent::Finished { status, .. } => {
                        assert!(saw_started);
                        assert_eq!(status, JobStatus::Failed);
                        break;
                    }
                    _ => {}
                }
            }
        }

        #[tokio::test]
        async fn test_checksum_only_on_first_run() {
            let dir = TempDir::new().unwrap();
            let manager = sh_manager(&dir, "echo \"$*\"\n");

            let first = manager
                .run_backup_job(docs(), GlobalSettings { transfers: 8, retries: 3, ..GlobalSettings::default() }, false)
                .await
                .unwrap();
            assert_eq!(first.status, JobStatus::Success);
            let first_args = manager.tracker().lines("Docs").join("\n");
            assert!(first_args.contains("/home/u/Documents"));
            assert!(first_args.contains("gdrive:Backups/Documents"));
            assert!(first_args.contains("--transfers=8"));
            assert!(first_args.contains("--retries=3"));
            assert!(first_args.contains("--checksum"));
            assert!(manager.last_run("Docs").is_some());

            manager
                .run_backup_job(docs(), GlobalSettings::default(), false)
                .await
                .unwrap();
            assert!(!manager.tracker().lines("Docs").join("\n").contains("--checksum"));
        }

        #[tokio::test]
        async fn test_dry_run_passes_flag_and_keeps_first_run() {
            let dir = TempDir::new().unwrap();
            let manager = sh_manager(&dir, "echo \"$*\"\n");

            let record = manager
                .run_backup_job(docs(), GlobalSettings::default(), true)
                .await
                .unwrap();
            assert!(record.dry_run);
            assert_eq!(record.status, JobStatus::Success);
            assert!(manager.tracker().lines("Docs")[0].ends_with("--dry-run"));
            // A dry run copies nothing, so the next real run still verifies
            assert!(manager.last_run("Docs").is_none());
        }

        #[tokio::test]
        async fn test_completions_survive_lagging_event_subscriber() {
            let dir = TempDir::new().unwrap();
            let manager = sh_manager(
                &dir,
                "i=0\nwhile [ $i -lt 3000 ]; do echo \"line $i\"; i=$((i+1)); done\n",
            );
            let mut events = manager.events().subscribe();
            let mut completions = manager.subscribe_completions();
            let dropped = manager.subscribe_completions();
            drop(dropped);

            let config = BackupConfig {
                backup_sets: vec![docs(), BackupSet::new("Photos", "/home/u/Pictures", "b2:photos")],
                ..BackupConfig::default()
            };
            manager.run_all(&config, false).wait().await;

            // The display bus overflowed...
            assert!(matches!(
                events.recv().await,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_))
            ));

            // ...but every finished record still arrived
            let mut names = Vec::new();
            while let Ok(record) = completions.try_recv() {
                assert_eq!(record.status, JobStatus::Success);
                assert!(record.end_time.is_some());
                names.push(record.backup_set_name);
            }
            names.sort();
            assert_eq!(names, ["Docs", "Photos"]);
            assert_eq!(manager.completion_sinks.len(), 1);
        }

        #[tokio::test]
        async fn test_run_all_never_overlaps_same_set() {
            let dir = TempDir::new().unwrap();
            let manager = sh_manager(&dir, "sleep 1\necho done\n");
            let config = BackupConfig {
                backup_sets: vec![docs(), BackupSet::new("Photos", "/home/u/Pictures", "b2:photos")],
                ..BackupConfig::default()
            };

            let first = manager.run_all(&config, false);
            let second = manager.run_all(&config, false);
            assert_eq!(first.started_names(), ["Docs", "Photos"]);
            assert!(second.started.is_empty());
            assert_eq!(second.skipped_running, ["Docs", "Photos"]);

            let records = first.wait().await;
            assert!(records.iter().all(|r| r.status == JobStatus::Success));

            // Once finished, the sets can run again
            let third = manager.run_all(&config, false);
            assert_eq!(third.started.len(), 2);
            third.wait().await;
        }

        #[tokio::test]
        async fn test_cancel_marks_failed() {
            let dir = TempDir::new().unwrap();
            let manager = sh_manager(&dir, "echo working\nsleep 30\n");

            let handle = manager
                .spawn_backup_job(docs(), GlobalSettings::default(), false)
                .unwrap();
            tokio::time::sleep(Duration::from_millis(300)).await;
            assert!(manager.cancel("Docs"));

            let record = handle.await.unwrap().unwrap();
            assert_eq!(record.status, JobStatus::Failed);
            assert!(record.exit_code.is_none());
            assert!(!manager.tracker().is_running("Docs"));
        }

        #[tokio::test]
        async fn test_job_unaffected_by_later_config_change() {
            let dir = TempDir::new().unwrap();
            let manager = sh_manager(&dir, "sleep 1\necho \"$*\"\n");
            let mut config = BackupConfig {
                backup_sets: vec![docs()],
                ..BackupConfig::default()
            };

            let report = manager.run_all(&config, false);
            config.remove_backup_set("Docs").unwrap();
            config.settings.transfers = 1;

            let records = report.wait().await;
            assert_eq!(records[0].status, JobStatus::Success);
            assert!(manager.tracker().lines("Docs")[0].contains("--transfers=8"));
        }
    }
}
