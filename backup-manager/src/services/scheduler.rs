use crate::events::JobEvent;
use crate::services::orchestrator::{BackupManager, RunAllReport};
use crate::store::ConfigStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

/// Re-runs every backup set on a fixed interval.
pub struct AutoRunScheduler {
    scheduler: Mutex<JobScheduler>,
    manager: Arc<BackupManager>,
    store: Arc<Mutex<ConfigStore>>,
    active: Mutex<Option<Uuid>>,
    started: Mutex<bool>,
    dry_run: bool,
}

impl AutoRunScheduler {
    pub async fn new(
        manager: Arc<BackupManager>,
        store: Arc<Mutex<ConfigStore>>,
        dry_run: bool,
    ) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            manager,
            store,
            active: Mutex::new(None),
            started: Mutex::new(false),
            dry_run,
        })
    }

    /// Arms auto-run: one pass now, then one every `interval`.
    pub async fn start(&self, interval: Duration) -> anyhow::Result<()> {
        self.stop().await?;

        let manager = self.manager.clone();
        let store = self.store.clone();
        let dry_run = self.dry_run;

        let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
            let manager = manager.clone();
            let store = store.clone();
            Box::pin(async move {
                let report = run_tick(&manager, &store, dry_run).await;
                if !report.skipped_running.is_empty() {
                    tracing::info!(skipped = ?report.skipped_running, "Auto-run: previous runs still in progress");
                }
            })
        })?;

        let scheduler = self.scheduler.lock().await;
        let id = scheduler.add(job).await?;
        {
            let mut started = self.started.lock().await;
            if !*started {
                scheduler.start().await?;
                *started = true;
            }
        }
        drop(scheduler);
        *self.active.lock().await = Some(id);

        let interval_min = interval.as_secs() / 60;
        self.manager.events().publish(JobEvent::AutoRun {
            enabled: true,
            interval_min,
        });
        tracing::info!(interval_secs = interval.as_secs(), "Auto-run enabled");

        run_tick(&self.manager, &self.store, self.dry_run).await;
        Ok(())
    }

    /// Disarms auto-run. Jobs already running are left alone.
    pub async fn stop(&self) -> anyhow::Result<()> {
        let Some(id) = self.active.lock().await.take() else {
            return Ok(());
        };
        self.scheduler.lock().await.remove(&id).await?;
        self.manager.events().publish(JobEvent::AutoRun {
            enabled: false,
            interval_min: 0,
        });
        tracing::info!("Auto-run disabled");
        Ok(())
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.stop().await?;
        if *self.started.lock().await {
            self.scheduler.lock().await.shutdown().await?;
        }
        Ok(())
    }
}

/// One auto-run pass: refresh the configuration from disk, then start every
/// set that is not still running from a previous pass.
pub async fn run_tick(
    manager: &Arc<BackupManager>,
    store: &Mutex<ConfigStore>,
    dry_run: bool,
) -> RunAllReport {
    let config = {
        let mut store = store.lock().await;
        // reload() keeps the previous state and logs on failure
        let _ = store.reload();
        store.config().clone()
    };
    manager.run_all(&config, dry_run)
}
