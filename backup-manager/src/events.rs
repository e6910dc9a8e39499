//! Progress events posted from backup jobs to whoever presents them.
//!
//! Jobs never block on the host: events go out on a broadcast channel and
//! slow subscribers simply lag.

use crate::models::JobStatus;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum JobEvent {
    #[serde(rename = "backup:started")]
    Started {
        name: String,
        run_id: Uuid,
        dry_run: bool,
    },

    /// One line of rclone output
    #[serde(rename = "backup:output")]
    Output { name: String, line: String },

    #[serde(rename = "backup:progress")]
    Progress { name: String, percent: f32 },

    #[serde(rename = "backup:finished")]
    Finished {
        name: String,
        status: JobStatus,
        exit_code: Option<i32>,
        dry_run: bool,
        finished_at: DateTime<Utc>,
    },

    /// Auto-run was armed or disarmed
    #[serde(rename = "autorun:state")]
    AutoRun { enabled: bool, interval_min: u64 },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<JobEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: JobEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
