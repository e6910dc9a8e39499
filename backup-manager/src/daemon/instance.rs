//! Single-instance guard.
//!
//! Two hosts running backups against the same configuration would race on
//! both the remotes and the JSON file, so each takes a PID lock file next to
//! the configuration first. A lock whose owner is gone is taken over.

use crate::utils::errors::InstanceError;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Held lock; the file is removed on drop.
#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, InstanceError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        // One retry after clearing a stale lock
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    tracing::debug!(path = %path.display(), "Instance lock acquired");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    match read_owner(&path)? {
                        Some(pid) if process_alive(pid) => return Err(InstanceError::Held(pid)),
                        owner => {
                            tracing::warn!(
                                path = %path.display(),
                                pid = ?owner,
                                "Removing stale instance lock"
                            );
                            match fs::remove_file(&path) {
                                Ok(()) => {}
                                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                                Err(e) => return Err(e.into()),
                            }
                        }
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }

        let pid = read_owner(&path)?.unwrap_or(0);
        Err(InstanceError::Held(pid))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "Failed to remove instance lock");
        }
    }
}

fn read_owner(path: &Path) -> io::Result<Option<u32>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(contents.trim().parse().ok()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    // kill(0, ..) targets our own process group
    let Some(raw) = i32::try_from(pid).ok().filter(|raw| *raw > 0) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        // Exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No cheap liveness check; treat any lock as held
    true
}
