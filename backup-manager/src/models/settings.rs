use crate::utils::errors::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;

// ── GlobalSettings ──

/// rclone tuning applied to every backup run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSettings {
    #[serde(default = "default_transfers")]
    pub transfers: u32,
    #[serde(default = "default_checkers")]
    pub checkers: u32,
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Delay between rclone retries, e.g. `10s`.
    #[serde(default = "default_retries_sleep")]
    pub retries_sleep: String,
}

fn default_transfers() -> u32 {
    8
}

fn default_checkers() -> u32 {
    8
}

fn default_retries() -> u32 {
    3
}

fn default_retries_sleep() -> String {
    "10s".to_string()
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            transfers: default_transfers(),
            checkers: default_checkers(),
            retries: default_retries(),
            retries_sleep: default_retries_sleep(),
        }
    }
}

impl GlobalSettings {
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.transfers == 0 {
            return Err(StoreError::Validation("transfers must be at least 1".into()));
        }
        if self.checkers == 0 {
            return Err(StoreError::Validation("checkers must be at least 1".into()));
        }
        if parse_duration(&self.retries_sleep).is_none() {
            return Err(StoreError::Validation(format!(
                "retries_sleep '{}' is not a duration like 500ms, 10s, 1m or 1h",
                self.retries_sleep
            )));
        }
        Ok(())
    }
}

/// Parses the subset of rclone duration syntax accepted for `retries_sleep`.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    let split = value.find(|c: char| !c.is_ascii_digit())?;
    let (digits, unit) = value.split_at(split);
    let amount: u64 = digits.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(amount)),
        "s" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_secs(amount.checked_mul(60)?)),
        "h" => Some(Duration::from_secs(amount.checked_mul(3600)?)),
        _ => None,
    }
}

// ── AppSettings ──

/// Host preferences. Keys this crate does not know about are kept as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppSettings {
    #[serde(default = "default_minimize_to_tray")]
    pub minimize_to_tray: bool,
    #[serde(default)]
    pub auto_run_enabled: bool,
    #[serde(default = "default_auto_run_interval_min")]
    pub auto_run_interval_min: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Longest accepted auto-run interval: one week.
pub const MAX_AUTO_RUN_INTERVAL_MIN: u64 = 7 * 24 * 60;

fn default_minimize_to_tray() -> bool {
    true
}

fn default_auto_run_interval_min() -> u64 {
    5
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            minimize_to_tray: default_minimize_to_tray(),
            auto_run_enabled: false,
            auto_run_interval_min: default_auto_run_interval_min(),
            extra: Map::new(),
        }
    }
}

impl AppSettings {
    pub fn validate(&self) -> Result<(), StoreError> {
        if !(1..=MAX_AUTO_RUN_INTERVAL_MIN).contains(&self.auto_run_interval_min) {
            return Err(StoreError::Validation(format!(
                "auto_run_interval_min must be between 1 and {MAX_AUTO_RUN_INTERVAL_MIN}, got {}",
                self.auto_run_interval_min
            )));
        }
        Ok(())
    }

    pub fn auto_run_interval(&self) -> Duration {
        let minutes = self
            .auto_run_interval_min
            .clamp(1, MAX_AUTO_RUN_INTERVAL_MIN);
        Duration::from_secs(minutes * 60)
    }
}
