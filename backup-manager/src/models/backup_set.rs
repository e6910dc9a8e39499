use crate::utils::errors::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

// ── BackupSet ──

/// A named pairing of a local folder and a remote destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupSet {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub local: String,
    /// Destination in `remote:path` form, resolved by rclone.
    #[serde(default)]
    pub remote: String,
    /// End time of the last completed non-dry run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
}

impl BackupSet {
    pub fn new(name: impl Into<String>, local: impl Into<String>, remote: impl Into<String>) -> Self {
        Self {
            name: name.into().trim().to_string(),
            local: local.into().trim().to_string(),
            remote: remote.into().trim().to_string(),
            last_run: None,
        }
    }

    /// Checks that name, local and remote are all present.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.name.trim().is_empty() {
            return Err(StoreError::Validation("backup set name is empty".into()));
        }
        if self.local.trim().is_empty() {
            return Err(StoreError::Validation(format!(
                "backup set '{}' has no local path",
                self.name
            )));
        }
        if self.remote.trim().is_empty() {
            return Err(StoreError::Validation(format!(
                "backup set '{}' has no remote path",
                self.name
            )));
        }
        Ok(())
    }

    /// Whether the set has enough information to be handed to rclone.
    pub fn is_runnable(&self) -> bool {
        !self.local.trim().is_empty() && !self.remote.trim().is_empty()
    }

    /// The remote actually passed to rclone.
    ///
    /// A bare `remote:folder` target gets the local folder's name appended so
    /// several sets can share one remote folder without overwriting each other.
    pub fn target_remote(&self) -> String {
        let rhs = self.remote.split_once(':').map(|(_, rhs)| rhs).unwrap_or("");
        if !rhs.is_empty() && !rhs.contains('/') {
            if let Some(folder) = Path::new(&self.local).file_name() {
                return format!(
                    "{}/{}",
                    self.remote.trim_end_matches('/'),
                    folder.to_string_lossy()
                );
            }
        }
        self.remote.clone()
    }
}

/// Rejects a local path that does not point at an existing directory.
pub fn check_local_dir(local: &str) -> Result<(), StoreError> {
    let path = Path::new(local);
    if !path.exists() {
        return Err(StoreError::Validation(format!(
            "local path does not exist: {local}"
        )));
    }
    if !path.is_dir() {
        return Err(StoreError::Validation(format!(
            "local path is not a directory: {local}"
        )));
    }
    Ok(())
}
