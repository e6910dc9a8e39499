//! Command-line host: configuration editing, one-shot runs and the auto-run daemon.

use anyhow::{bail, Context, Result};
use backup_manager::daemon::instance::InstanceLock;
use backup_manager::daemon::shutdown::ShutdownCoordinator;
use backup_manager::events::JobEvent;
use backup_manager::executor::log::{tail, JobLog};
use backup_manager::executor::progress::format_duration;
use backup_manager::executor::RcloneRunner;
use backup_manager::models::backup_set::check_local_dir;
use backup_manager::services::scheduler::AutoRunScheduler;
use backup_manager::{
    BackupConfig, BackupManager, BackupSet, ConfigStore, JobRecord, JobStatus, RuntimeConfig, StoreError,
};
use chrono::{DateTime, Local, Utc};
use clap::builder::BoolishValueParser;
use clap::Subcommand;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// How long running backups get to wind down after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List backup sets.
    List {
        /// Print the sets as JSON.
        #[arg(long)]
        json: bool,
    },
    /// Add a backup set.
    Add {
        name: String,
        /// Local folder to back up.
        local: String,
        /// rclone destination, e.g. gdrive:Backups
        remote: String,
    },
    /// Change a backup set. At least one of --name/--local/--remote is required.
    Edit {
        /// Current name of the set.
        name: String,
        /// New name.
        #[arg(long = "name", value_name = "NEW_NAME", required_unless_present_any = ["local", "remote"])]
        new_name: Option<String>,
        #[arg(long, required_unless_present_any = ["new_name", "remote"])]
        local: Option<String>,
        #[arg(long, required_unless_present_any = ["new_name", "local"])]
        remote: Option<String>,
    },
    /// Remove a backup set.
    Remove { name: String },
    /// Show or change global settings.
    Settings(SettingsArgs),
    /// Run backup sets once and wait for them.
    Run {
        /// Pass --dry-run to rclone.
        #[arg(long)]
        dry_run: bool,
        /// Only run these sets.
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
    },
    /// Run every backup set now and then on the auto-run interval until stopped.
    Daemon {
        /// Pass --dry-run to rclone.
        #[arg(long)]
        dry_run: bool,
        /// Turn auto-run on in the configuration if it is off.
        #[arg(long)]
        enable: bool,
        /// Print events as JSON lines.
        #[arg(long)]
        json: bool,
    },
    /// Show the end of a backup set's log.
    Logs {
        name: String,
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
}

#[derive(clap::Args, Debug, Default)]
pub struct SettingsArgs {
    #[arg(long)]
    transfers: Option<u32>,
    #[arg(long)]
    checkers: Option<u32>,
    #[arg(long)]
    retries: Option<u32>,
    /// Delay between retries, e.g. 10s
    #[arg(long)]
    retries_sleep: Option<String>,
    /// Minutes between auto-runs.
    #[arg(long)]
    auto_run_interval: Option<u64>,
    /// on/off
    #[arg(long, value_parser = BoolishValueParser::new())]
    auto_run: Option<bool>,
    /// on/off
    #[arg(long, value_parser = BoolishValueParser::new())]
    minimize_to_tray: Option<bool>,
}

impl SettingsArgs {
    fn is_empty(&self) -> bool {
        self.transfers.is_none()
            && self.checkers.is_none()
            && self.retries.is_none()
            && self.retries_sleep.is_none()
            && self.auto_run_interval.is_none()
            && self.auto_run.is_none()
            && self.minimize_to_tray.is_none()
    }
}

pub async fn execute(command: Command, runtime: &RuntimeConfig) -> Result<()> {
    match command {
        Command::List { json } => {
            let store = open_store(runtime)?;
            list(&store, json)
        }
        Command::Add {
            name,
            local,
            remote,
        } => {
            let mut store = open_store(runtime)?;
            add(&mut store, name, local, remote)?;
            println!("Added backup set.");
            Ok(())
        }
        Command::Edit {
            name,
            new_name,
            local,
            remote,
        } => {
            let mut store = open_store(runtime)?;
            edit(&mut store, &name, new_name, local, remote)?;
            println!("Updated backup set '{name}'.");
            Ok(())
        }
        Command::Remove { name } => {
            let mut store = open_store(runtime)?;
            store.config_mut().remove_backup_set(&name)?;
            store.save()?;
            println!("Removed backup set '{name}'.");
            Ok(())
        }
        Command::Settings(args) => {
            let mut store = open_store(runtime)?;
            if !args.is_empty() {
                apply_settings(&mut store, &args)?;
            }
            print_settings(&store);
            Ok(())
        }
        Command::Run { dry_run, only } => run(runtime, dry_run, &only).await,
        Command::Daemon {
            dry_run,
            enable,
            json,
        } => daemon(runtime, dry_run, enable, json).await,
        Command::Logs { name, lines } => {
            let path = JobLog::path_for(&runtime.log_dir, &name);
            match tail(&path, lines) {
                Ok(lines) => {
                    for line in lines {
                        println!("{line}");
                    }
                    Ok(())
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    println!("No log for '{name}' yet ({}).", path.display());
                    Ok(())
                }
                Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
            }
        }
    }
}

fn open_store(runtime: &RuntimeConfig) -> Result<ConfigStore> {
    ConfigStore::open(&runtime.config_path)
        .with_context(|| format!("Failed to open {}", runtime.config_path.display()))
}

fn build_manager(runtime: &RuntimeConfig) -> Arc<BackupManager> {
    let runner = RcloneRunner::new(runtime.rclone_bin.clone())
        .with_global_flags(runtime.rclone_global_flags.clone());
    Arc::new(BackupManager::new(runner, runtime.log_dir.clone()))
}

// ── Configuration commands ──

fn list(store: &ConfigStore, json: bool) -> Result<()> {
    let sets = &store.config().backup_sets;
    if json {
        println!("{}", serde_json::to_string_pretty(sets)?);
        return Ok(());
    }
    if sets.is_empty() {
        println!("No backup sets in {}.", store.path().display());
        return Ok(());
    }
    for set in sets {
        let last_run = set
            .last_run
            .map(format_local)
            .unwrap_or_else(|| "never".to_string());
        println!("{}", set.name);
        println!("    local:    {}", set.local);
        println!("    remote:   {}", set.target_remote());
        println!("    last run: {last_run}");
    }
    Ok(())
}

fn add(store: &mut ConfigStore, name: String, local: String, remote: String) -> Result<()> {
    check_local_dir(local.trim())?;
    store
        .config_mut()
        .add_backup_set(BackupSet::new(name, local, remote))?;
    store.save()?;
    Ok(())
}

fn edit(
    store: &mut ConfigStore,
    name: &str,
    new_name: Option<String>,
    local: Option<String>,
    remote: Option<String>,
) -> Result<()> {
    let current = store
        .config()
        .find(name)
        .cloned()
        .ok_or_else(|| StoreError::NotFound(name.to_string()))?;
    if let Some(local) = &local {
        check_local_dir(local.trim())?;
    }
    let updated = BackupSet::new(
        new_name.unwrap_or(current.name),
        local.unwrap_or(current.local),
        remote.unwrap_or(current.remote),
    );
    store.config_mut().update_backup_set(name, updated)?;
    store.save()?;
    Ok(())
}

fn apply_settings(store: &mut ConfigStore, args: &SettingsArgs) -> Result<()> {
    let mut settings = store.config().settings.clone();
    if let Some(v) = args.transfers {
        settings.transfers = v;
    }
    if let Some(v) = args.checkers {
        settings.checkers = v;
    }
    if let Some(v) = args.retries {
        settings.retries = v;
    }
    if let Some(v) = &args.retries_sleep {
        settings.retries_sleep = v.trim().to_string();
    }

    let mut app = store.config().app_settings.clone();
    if let Some(v) = args.auto_run_interval {
        app.auto_run_interval_min = v;
    }
    if let Some(v) = args.auto_run {
        app.auto_run_enabled = v;
    }
    if let Some(v) = args.minimize_to_tray {
        app.minimize_to_tray = v;
    }

    let config = store.config_mut();
    config.set_settings(settings)?;
    config.set_app_settings(app)?;
    store.save()?;
    Ok(())
}

fn print_settings(store: &ConfigStore) {
    let config = store.config();
    let on_off = |v: bool| if v { "on" } else { "off" };
    println!("transfers:         {}", config.settings.transfers);
    println!("checkers:          {}", config.settings.checkers);
    println!("retries:           {}", config.settings.retries);
    println!("retries sleep:     {}", config.settings.retries_sleep);
    println!("auto-run:          {}", on_off(config.app_settings.auto_run_enabled));
    println!("auto-run interval: {} min", config.app_settings.auto_run_interval_min);
    println!("minimize to tray:  {}", on_off(config.app_settings.minimize_to_tray));
}

// ── Running backups ──

async fn run(runtime: &RuntimeConfig, dry_run: bool, only: &[String]) -> Result<()> {
    let _lock = InstanceLock::acquire(runtime.lock_path())?;
    let mut store = open_store(runtime)?;
    let config = store.config().clone();

    let sets = select_sets(&config, only)?;
    if sets.is_empty() {
        println!("No backup sets configured.");
        return Ok(());
    }

    let manager = build_manager(runtime);
    manager.seed_last_runs(&config.backup_sets);
    let mut rx = manager.events().subscribe();

    let report = manager.run_sets(&sets, &config.settings, dry_run);
    for name in &report.skipped_invalid {
        println!("[{name}] skipped: missing local or remote path");
    }

    let shutdown = ShutdownCoordinator::new();
    let watcher = {
        let shutdown = shutdown.clone();
        let manager = manager.clone();
        tokio::spawn(async move {
            shutdown.wait_for_signal().await;
            manager.cancel_all();
        })
    };

    let wait = report.wait();
    tokio::pin!(wait);
    let records = loop {
        tokio::select! {
            records = &mut wait => break records,
            event = rx.recv() => match event {
                Ok(event) => print_event(&event, false),
                Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "Output display fell behind"),
                Err(RecvError::Closed) => {}
            },
        }
    };
    while let Ok(event) = rx.try_recv() {
        print_event(&event, false);
    }
    shutdown.trigger();
    let _ = watcher.await;

    if !dry_run && persist_last_runs(&mut store, &records) {
        store.save()?;
    }

    println!();
    for record in &records {
        println!("{}", summary_line(record));
    }

    // Sets that never started count as failures too
    let failed = records
        .iter()
        .filter(|r| r.status == JobStatus::Failed)
        .count()
        + sets.len().saturating_sub(records.len());
    if failed > 0 {
        bail!("{failed} of {} backup(s) failed", sets.len());
    }
    Ok(())
}

/// Every set, or the named ones once each in the order given.
fn select_sets(config: &BackupConfig, only: &[String]) -> Result<Vec<BackupSet>, StoreError> {
    if only.is_empty() {
        return Ok(config.backup_sets.clone());
    }
    let mut seen = HashSet::new();
    only.iter()
        .filter(|name| seen.insert(name.as_str()))
        .map(|name| {
            config
                .find(name)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(name.clone()))
        })
        .collect()
}

/// Writes end times of finished real runs into the store. Returns whether
/// anything changed.
fn persist_last_runs(store: &mut ConfigStore, records: &[JobRecord]) -> bool {
    if let Err(e) = store.reload() {
        tracing::warn!(error = %e, "Recording last runs against the previously loaded configuration");
    }
    let mut changed = false;
    for record in records.iter().filter(|r| !r.dry_run) {
        if let Some(at) = record.end_time {
            changed |= store
                .config_mut()
                .record_last_run(&record.backup_set_name, at);
        }
    }
    changed
}

async fn daemon(runtime: &RuntimeConfig, dry_run: bool, enable: bool, json: bool) -> Result<()> {
    let _lock = InstanceLock::acquire(runtime.lock_path())?;
    let mut store = open_store(runtime)?;

    if !store.config().app_settings.auto_run_enabled {
        if !enable {
            bail!(
                "Auto-run is off in {}. Turn it on with `settings --auto-run on` or pass --enable",
                store.path().display()
            );
        }
        let mut app = store.config().app_settings.clone();
        app.auto_run_enabled = true;
        store.config_mut().set_app_settings(app)?;
        store.save()?;
    }

    let interval = store.config().app_settings.auto_run_interval();
    let manager = build_manager(runtime);
    manager.seed_last_runs(&store.config().backup_sets);
    let store = Arc::new(Mutex::new(store));

    let events_stop = CancellationToken::new();
    let events_task = tokio::spawn(handle_events(
        manager.events().subscribe(),
        json,
        events_stop.clone(),
    ));
    let persist_task = tokio::spawn(persist_completions(
        manager.subscribe_completions(),
        store.clone(),
        events_stop.clone(),
    ));

    let shutdown = ShutdownCoordinator::new();
    let scheduler = AutoRunScheduler::new(manager.clone(), store.clone(), dry_run).await?;
    scheduler.start(interval).await?;
    tracing::info!(
        interval_min = interval.as_secs() / 60,
        dry_run,
        "Daemon running; press Ctrl+C to stop"
    );

    shutdown.wait_for_signal().await;

    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!(error = %e, "Failed to stop scheduler");
    }
    manager.cancel_all();
    let tracker = manager.tracker().clone();
    shutdown
        .drain(SHUTDOWN_GRACE, || tracker.running_count())
        .await;

    events_stop.cancel();
    if tokio::time::timeout(Duration::from_secs(3), persist_task)
        .await
        .is_err()
    {
        tracing::warn!("Last-run writer did not stop in time");
    }
    if tokio::time::timeout(Duration::from_secs(3), events_task)
        .await
        .is_err()
    {
        tracing::warn!("Event handler did not stop in time");
    }
    Ok(())
}

/// Prints events until `stop` fires. Display only; lagging here loses nothing
/// that needs to be saved.
async fn handle_events(mut rx: broadcast::Receiver<JobEvent>, json: bool, stop: CancellationToken) {
    loop {
        let event = tokio::select! {
            _ = stop.cancelled() => break,
            event = rx.recv() => event,
        };
        match event {
            Ok(event) => print_event(&event, json),
            Err(RecvError::Lagged(n)) => tracing::warn!(skipped = n, "Event display fell behind"),
            Err(RecvError::Closed) => return,
        }
    }
    while let Ok(event) = rx.try_recv() {
        print_event(&event, json);
    }
}

/// Writes the end time of every finished real run back to the configuration.
async fn persist_completions(
    mut rx: mpsc::UnboundedReceiver<JobRecord>,
    store: Arc<Mutex<ConfigStore>>,
    stop: CancellationToken,
) {
    loop {
        let record = tokio::select! {
            _ = stop.cancelled() => break,
            record = rx.recv() => record,
        };
        match record {
            Some(record) => record_last_run(&store, &record).await,
            None => return,
        }
    }
    while let Ok(record) = rx.try_recv() {
        record_last_run(&store, &record).await;
    }
}

async fn record_last_run(store: &Mutex<ConfigStore>, record: &JobRecord) {
    let (false, Some(at)) = (record.dry_run, record.end_time) else {
        return;
    };
    let name = &record.backup_set_name;
    let mut store = store.lock().await;
    if let Err(e) = store.reload() {
        tracing::warn!(error = %e, "Recording last run against the previously loaded configuration");
    }
    if !store.config_mut().record_last_run(name, at) {
        tracing::debug!(job = %name, "Backup set removed before its run finished");
        return;
    }
    if let Err(e) = store.save() {
        tracing::error!(job = %name, error = %e, "Failed to save last run time");
    }
}

// ── Output ──

fn print_event(event: &JobEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(e) => tracing::warn!(error = %e, "Failed to encode event"),
        }
        return;
    }
    match event {
        JobEvent::Started { name, dry_run, .. } => {
            let mode = if *dry_run { " (dry run)" } else { "" };
            println!("[{name}] started{mode}");
        }
        JobEvent::Output { name, line } => println!("[{name}] {line}"),
        JobEvent::Progress { .. } => {}
        JobEvent::Finished {
            name,
            status,
            exit_code,
            ..
        } => match exit_code {
            Some(code) => println!("[{name}] finished: {status} (exit code {code})"),
            None => println!("[{name}] finished: {status}"),
        },
        JobEvent::AutoRun {
            enabled: true,
            interval_min,
        } => println!("Auto-run on, every {interval_min} min"),
        JobEvent::AutoRun { enabled: false, .. } => println!("Auto-run off"),
    }
}

fn summary_line(record: &JobRecord) -> String {
    let elapsed = record
        .duration()
        .and_then(|d| d.to_std().ok())
        .map(format_duration)
        .unwrap_or_else(|| "-".to_string());
    let mode = if record.dry_run { ", dry run" } else { "" };
    format!(
        "{:<24} {:<8} {elapsed}{mode}",
        record.backup_set_name, record.status
    )
}

fn format_local(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()
}
