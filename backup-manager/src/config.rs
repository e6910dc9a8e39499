//! Runtime configuration for the host process.
//!
//! Resolved from CLI overrides, a `.env` file and environment variables.
//! Backup sets and rclone tuning live in the JSON store instead.

use std::path::{Path, PathBuf};

/// Configuration file name used when nothing else is specified.
pub const DEFAULT_CONFIG_FILE: &str = "folders.json";

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Path to the JSON store
    pub config_path: PathBuf,

    /// Directory for per-backup-set log files
    pub log_dir: PathBuf,

    /// rclone executable
    pub rclone_bin: PathBuf,

    /// Flags placed before the rclone subcommand, e.g. `--config /etc/rclone.conf`
    pub rclone_global_flags: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl RuntimeConfig {
    pub fn from_env(config_override: Option<PathBuf>) -> Self {
        let _ = dotenvy::dotenv();
        Self::from_lookup(config_override, |key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(config_override: Option<PathBuf>, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let config_path = config_override
            .or_else(|| lookup("BACKUP_MANAGER_CONFIG").map(PathBuf::from))
            .unwrap_or_else(|| default_base_dir().join(DEFAULT_CONFIG_FILE));

        let log_dir = lookup("BACKUP_MANAGER_LOG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                config_path
                    .parent()
                    .unwrap_or_else(|| Path::new(""))
                    .join("logs")
            });

        Self {
            log_dir,
            rclone_bin: PathBuf::from(lookup("RCLONE_BIN").unwrap_or_else(|| "rclone".into())),
            rclone_global_flags: lookup("RCLONE_GLOBAL_FLAGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".into()),
            config_path,
        }
    }

    /// Lock file guarding against two processes running backups for one store.
    pub fn lock_path(&self) -> PathBuf {
        let mut name = self
            .config_path
            .file_name()
            .unwrap_or_default()
            .to_os_string();
        name.push(".lock");
        self.config_path.with_file_name(name)
    }
}

/// The directory holding the executable, falling back to the working directory.
fn default_base_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::from_lookup(None, lookup_from(&[]));
        assert_eq!(config.config_path.file_name().unwrap(), DEFAULT_CONFIG_FILE);
        assert_eq!(config.log_dir, config.config_path.parent().unwrap().join("logs"));
        assert_eq!(config.rclone_bin, PathBuf::from("rclone"));
        assert!(config.rclone_global_flags.is_empty());
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_override_wins_over_env() {
        let config = RuntimeConfig::from_lookup(
            Some(PathBuf::from("/etc/backups/sets.json")),
            lookup_from(&[("BACKUP_MANAGER_CONFIG", "/tmp/other.json")]),
        );
        assert_eq!(config.config_path, PathBuf::from("/etc/backups/sets.json"));
        assert_eq!(config.log_dir, PathBuf::from("/etc/backups/logs"));
        assert_eq!(config.lock_path(), PathBuf::from("/etc/backups/sets.json.lock"));
    }

    #[test]
    fn test_env_values() {
        let config = RuntimeConfig::from_lookup(
            None,
            lookup_from(&[
                ("BACKUP_MANAGER_CONFIG", "/srv/folders.json"),
                ("BACKUP_MANAGER_LOG_DIR", "/var/log/backups"),
                ("RCLONE_BIN", "/opt/rclone/rclone"),
                ("RCLONE_GLOBAL_FLAGS", "--config  /etc/rclone.conf"),
                ("LOG_LEVEL", "debug"),
            ]),
        );
        assert_eq!(config.config_path, PathBuf::from("/srv/folders.json"));
        assert_eq!(config.log_dir, PathBuf::from("/var/log/backups"));
        assert_eq!(config.rclone_bin, PathBuf::from("/opt/rclone/rclone"));
        assert_eq!(config.rclone_global_flags, ["--config", "/etc/rclone.conf"]);
        assert_eq!(config.log_level, "debug");
    }
}
