//! JSON configuration store.
//!
//! Holds the ordered list of backup sets plus global and app settings, and
//! persists them to a single JSON file. Writes go to a sibling temp file that
//! is renamed over the target, so a concurrent reader sees either the old or
//! the new document.

use crate::models::{AppSettings, BackupSet, GlobalSettings};
use crate::utils::errors::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// In-memory form of the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub backup_sets: Vec<BackupSet>,
    #[serde(default)]
    pub settings: GlobalSettings,
    #[serde(default)]
    pub app_settings: AppSettings,
}

impl BackupConfig {
    pub fn find(&self, name: &str) -> Option<&BackupSet> {
        self.backup_sets.iter().find(|s| s.name == name)
    }

    fn position(&self, name: &str) -> Result<usize, StoreError> {
        self.backup_sets
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| StoreError::NotFound(name.to_string()))
    }

    /// Appends a new set. Names must be unique.
    pub fn add_backup_set(&mut self, set: BackupSet) -> Result<(), StoreError> {
        let set = BackupSet::new(set.name, set.local, set.remote);
        set.validate()?;
        if self.find(&set.name).is_some() {
            return Err(StoreError::DuplicateName(set.name));
        }
        self.backup_sets.push(set);
        Ok(())
    }

    /// Replaces the set called `name` in place, keeping its last-run time.
    pub fn update_backup_set(&mut self, name: &str, updated: BackupSet) -> Result<(), StoreError> {
        let index = self.position(name)?;
        let mut updated = BackupSet::new(updated.name, updated.local, updated.remote);
        updated.validate()?;
        if updated.name != name && self.find(&updated.name).is_some() {
            return Err(StoreError::DuplicateName(updated.name));
        }
        updated.last_run = self.backup_sets[index].last_run;
        self.backup_sets[index] = updated;
        Ok(())
    }

    pub fn remove_backup_set(&mut self, name: &str) -> Result<BackupSet, StoreError> {
        let index = self.position(name)?;
        Ok(self.backup_sets.remove(index))
    }

    pub fn set_settings(&mut self, settings: GlobalSettings) -> Result<(), StoreError> {
        settings.validate()?;
        self.settings = settings;
        Ok(())
    }

    pub fn set_app_settings(&mut self, app_settings: AppSettings) -> Result<(), StoreError> {
        app_settings.validate()?;
        self.app_settings = app_settings;
        Ok(())
    }

    /// Stores `at` as the last run of `name`. Returns false if the set is gone.
    pub fn record_last_run(&mut self, name: &str, at: DateTime<Utc>) -> bool {
        match self.backup_sets.iter_mut().find(|s| s.name == name) {
            Some(set) => {
                set.last_run = Some(at);
                true
            }
            None => false,
        }
    }

    fn check_unique_names(&self) -> Result<(), StoreError> {
        let mut seen = HashSet::new();
        for set in &self.backup_sets {
            if !seen.insert(set.name.as_str()) {
                return Err(StoreError::DuplicateName(set.name.clone()));
            }
        }
        Ok(())
    }
}

/// A [`BackupConfig`] bound to the file it was loaded from.
#[derive(Debug)]
pub struct ConfigStore {
    path: PathBuf,
    config: BackupConfig,
}

impl ConfigStore {
    /// Opens the store at `path`, writing a default file first if none exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if !path.exists() {
            tracing::info!(path = %path.display(), "Creating default configuration");
            write_atomic(&path, &BackupConfig::default())?;
        }
        let config = Self::load(&path)?;
        Ok(Self { path, config })
    }

    /// Parses the configuration file without touching any store.
    pub fn load(path: &Path) -> Result<BackupConfig, StoreError> {
        let content = fs::read_to_string(path)?;
        let config: BackupConfig = serde_json::from_str(&content)?;
        config.check_unique_names()?;
        config.settings.validate()?;
        config.app_settings.validate()?;
        Ok(config)
    }

    /// Re-reads the file. On error the previous in-memory state is kept.
    pub fn reload(&mut self) -> Result<(), StoreError> {
        match Self::load(&self.path) {
            Ok(config) => {
                self.config = config;
                Ok(())
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Keeping previous configuration");
                Err(e)
            }
        }
    }

    pub fn save(&self) -> Result<(), StoreError> {
        write_atomic(&self.path, &self.config)?;
        tracing::debug!(path = %self.path.display(), "Configuration saved");
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut BackupConfig {
        &mut self.config
    }
}

fn write_atomic(path: &Path, config: &BackupConfig) -> Result<(), StoreError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = path.with_file_name(tmp_name);

    let file = fs::File::create(&tmp_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, config)?;
    writer.write_all(b"\n")?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_config() -> BackupConfig {
        let mut config = BackupConfig::default();
        config
            .add_backup_set(BackupSet::new("Docs", "/home/u/Documents", "gdrive:Backups/Documents"))
            .unwrap();
        config
            .add_backup_set(BackupSet::new("Photos", "/home/u/Pictures", "b2:photos"))
            .unwrap();
        config
            .add_backup_set(BackupSet::new("Code", "/home/u/src", "gdrive:Code"))
            .unwrap();
        config
    }

    #[test]
    fn test_open_creates_default_file() -> Result<(), StoreError> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("nested").join("folders.json");

        let store = ConfigStore::open(&path)?;
        assert!(path.exists());
        assert!(store.config().backup_sets.is_empty());
        assert_eq!(store.config().settings, GlobalSettings::default());

        let raw: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path)?)?;
        assert!(raw["backup_sets"].as_array().unwrap().is_empty());
        assert_eq!(raw["settings"]["retries_sleep"], "10s");
        assert_eq!(raw["app_settings"]["auto_run_interval_min"], 5);
        Ok(())
    }

    #[test]
    fn test_save_then_reload_keeps_order() -> Result<(), StoreError> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("folders.json");

        let mut store = ConfigStore::open(&path)?;
        *store.config_mut() = sample_config();
        store.save()?;

        let reloaded = ConfigStore::load(&path)?;
        assert_eq!(reloaded.backup_sets, store.config().backup_sets);
        let names: Vec<_> = reloaded.backup_sets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["Docs", "Photos", "Code"]);
        assert!(!temp_dir.path().join("folders.json.tmp").exists());
        Ok(())
    }

    #[test]
    fn test_load_accepts_original_layout() -> Result<(), StoreError> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("folders.json");
        fs::write(
            &path,
            r#"{
              "backup_sets": [{"name": "Docs", "local": "/home/u/Documents", "remote": "gdrive:Backups"}],
              "settings": {"transfers": 4, "checkers": 16, "retries": 5, "retries_sleep": "30s"},
              "app_settings": {"minimize_to_tray": true, "auto_run_enabled": true, "auto_run_interval_min": 10, "theme": "cosmo"}
            }"#,
        )?;

        let config = ConfigStore::load(&path)?;
        assert_eq!(config.backup_sets.len(), 1);
        assert_eq!(config.settings.transfers, 4);
        assert_eq!(config.settings.checkers, 16);
        assert_eq!(config.app_settings.auto_run_interval_min, 10);
        assert_eq!(config.app_settings.extra["theme"], "cosmo");
        Ok(())
    }

    #[test]
    fn test_missing_sections_fall_back_to_defaults() -> Result<(), StoreError> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("folders.json");
        fs::write(&path, r#"{"backup_sets": []}"#)?;

        let config = ConfigStore::load(&path)?;
        assert_eq!(config.settings, GlobalSettings::default());
        assert_eq!(config.app_settings, AppSettings::default());
        Ok(())
    }

    #[test]
    fn test_reload_keeps_state_on_malformed_json() -> Result<(), StoreError> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("folders.json");

        let mut store = ConfigStore::open(&path)?;
        *store.config_mut() = sample_config();
        store.save()?;

        fs::write(&path, "{ not json")?;
        let err = store.reload().unwrap_err();
        assert!(matches!(err, StoreError::Parse(_)));
        assert_eq!(store.config().backup_sets.len(), 3);
        Ok(())
    }

    #[test]
    fn test_load_rejects_invalid_settings() -> Result<(), StoreError> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("folders.json");

        for bad in [
            r#"{"app_settings": {"auto_run_interval_min": 18446744073709551615}}"#,
            r#"{"app_settings": {"auto_run_interval_min": 0}}"#,
            r#"{"settings": {"transfers": 0}}"#,
            r#"{"settings": {"retries_sleep": "soon"}}"#,
        ] {
            fs::write(&path, bad)?;
            assert!(
                matches!(ConfigStore::load(&path), Err(StoreError::Validation(_))),
                "accepted {bad}"
            );
        }

        // A bad edit on disk leaves the loaded settings in place
        fs::write(&path, "{}")?;
        let mut store = ConfigStore::open(&path)?;
        fs::write(&path, r#"{"settings": {"checkers": 0}}"#)?;
        assert!(matches!(store.reload(), Err(StoreError::Validation(_))));
        assert_eq!(store.config().settings.checkers, 8);
        Ok(())
    }

    #[test]
    fn test_load_rejects_duplicate_names() -> Result<(), StoreError> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("folders.json");
        fs::write(
            &path,
            r#"{"backup_sets": [
                {"name": "Docs", "local": "/a", "remote": "r:a"},
                {"name": "Docs", "local": "/b", "remote": "r:b"}
            ]}"#,
        )?;

        assert!(matches!(ConfigStore::load(&path), Err(StoreError::DuplicateName(n)) if n == "Docs"));
        Ok(())
    }

    #[test]
    fn test_add_rejects_duplicate_name() {
        let mut config = sample_config();
        let err = config
            .add_backup_set(BackupSet::new("Docs", "/other", "gdrive:Other"))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName(n) if n == "Docs"));
        assert_eq!(config.backup_sets.len(), 3);
    }

    #[test]
    fn test_add_rejects_empty_paths() {
        let mut config = BackupConfig::default();
        assert!(matches!(
            config.add_backup_set(BackupSet::new("Docs", "", "gdrive:Docs")),
            Err(StoreError::Validation(_))
        ));
        assert!(config.backup_sets.is_empty());
    }

    #[test]
    fn test_update_rejects_rename_onto_existing() {
        let mut config = sample_config();
        let err = config
            .update_backup_set("Photos", BackupSet::new("Docs", "/home/u/Pictures", "b2:photos"))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateName(_)));
        assert_eq!(config.backup_sets[1].name, "Photos");
    }

    #[test]
    fn test_update_keeps_position_and_last_run() {
        let mut config = sample_config();
        let at = Utc::now();
        assert!(config.record_last_run("Photos", at));

        config
            .update_backup_set("Photos", BackupSet::new("Pictures", "/home/u/Pictures", "b2:pics"))
            .unwrap();
        assert_eq!(config.backup_sets[1].name, "Pictures");
        assert_eq!(config.backup_sets[1].remote, "b2:pics");
        assert_eq!(config.backup_sets[1].last_run, Some(at));
    }

    #[test]
    fn test_update_same_name_is_allowed() {
        let mut config = sample_config();
        config
            .update_backup_set("Docs", BackupSet::new("Docs", "/srv/docs", "gdrive:Docs"))
            .unwrap();
        assert_eq!(config.find("Docs").unwrap().local, "/srv/docs");
    }

    #[test]
    fn test_remove_backup_set() {
        let mut config = sample_config();
        let removed = config.remove_backup_set("Photos").unwrap();
        assert_eq!(removed.name, "Photos");
        assert_eq!(config.backup_sets.len(), 2);
        assert!(matches!(
            config.remove_backup_set("Photos"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_record_last_run_unknown_set() {
        let mut config = sample_config();
        assert!(!config.record_last_run("Gone", Utc::now()));
    }

    #[test]
    fn test_set_settings_validates() {
        let mut config = BackupConfig::default();
        let bad = GlobalSettings {
            checkers: 0,
            ..GlobalSettings::default()
        };
        assert!(config.set_settings(bad).is_err());
        assert_eq!(config.settings, GlobalSettings::default());
    }
}
