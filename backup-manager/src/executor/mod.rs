//! rclone job runner.
//!
//! Builds the rclone command line for a backup set and runs it, streaming
//! stdout and stderr line by line to a caller-supplied sink. Retries are left
//! to rclone itself via `--retries`.

pub mod log;
pub mod progress;

use crate::models::{BackupSet, GlobalSettings};
use crate::utils::errors::RunnerError;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// rclone subcommand used for every backup.
const SUBCOMMAND: &str = "copy";

/// How long a cancelled rclone gets to exit after SIGTERM before it is killed.
const KILL_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunOptions {
    /// Report what would be copied without copying anything
    pub dry_run: bool,
    /// First run of the set: verify with checksums instead of size/modtime
    pub first_run: bool,
}

/// How the rclone process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    Exited(i32),
    /// Terminated by a signal we did not send
    Signalled,
    Cancelled,
}

impl ExitState {
    pub fn code(&self) -> Option<i32> {
        match self {
            ExitState::Exited(code) => Some(*code),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.code() == Some(0)
    }
}

/// Arguments passed to rclone after the subcommand-level global flags.
pub fn build_args(set: &BackupSet, settings: &GlobalSettings, opts: RunOptions) -> Vec<String> {
    let mut args = vec![
        SUBCOMMAND.to_string(),
        set.local.clone(),
        set.target_remote(),
        "--progress".to_string(),
        format!("--transfers={}", settings.transfers),
        format!("--checkers={}", settings.checkers),
        format!("--retries={}", settings.retries),
        format!("--retries-sleep={}", settings.retries_sleep),
    ];
    if opts.first_run {
        args.push("--checksum".to_string());
    }
    if opts.dry_run {
        args.push("--dry-run".to_string());
    }
    args
}

/// Launches rclone processes.
#[derive(Debug, Clone)]
pub struct RcloneRunner {
    program: PathBuf,
    global_flags: Vec<String>,
}

impl RcloneRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            global_flags: Vec::new(),
        }
    }

    /// Flags placed before the subcommand, e.g. `--config <file>`.
    pub fn with_global_flags(mut self, flags: Vec<String>) -> Self {
        self.global_flags = flags;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Shell-like rendering of the full command, for logs.
    pub fn command_line(&self, args: &[String]) -> String {
        std::iter::once(self.program.display().to_string())
            .chain(self.global_flags.iter().cloned())
            .chain(args.iter().cloned())
            .map(|part| quote(&part))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Runs rclone with `args` until it exits or `cancel` fires.
    ///
    /// Every output line, from either stream, is handed to `on_line` as it
    /// arrives. Invalid UTF-8 is replaced rather than treated as an error.
    pub async fn run(
        &self,
        args: &[String],
        cancel: &CancellationToken,
        on_line: &mut (dyn FnMut(&str) + Send),
    ) -> Result<ExitState, RunnerError> {
        let mut child = Command::new(&self.program)
            .args(&self.global_flags)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => {
                    RunnerError::ToolNotFound(self.program.display().to_string())
                }
                _ => RunnerError::Spawn {
                    program: self.program.display().to_string(),
                    source: e,
                },
            })?;

        debug!(pid = ?child.id(), program = %self.program.display(), "rclone started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("stderr was not captured"))?;

        let mut out = BufReader::new(stdout).split(b'\n');
        let mut err = BufReader::new(stderr).split(b'\n');
        let (mut out_open, mut err_open) = (true, true);

        while out_open || err_open {
            tokio::select! {
                segment = out.next_segment(), if out_open => match segment? {
                    Some(bytes) => on_line(&decode_line(&bytes)),
                    None => out_open = false,
                },
                segment = err.next_segment(), if err_open => match segment? {
                    Some(bytes) => on_line(&decode_line(&bytes)),
                    None => err_open = false,
                },
                _ = cancel.cancelled() => {
                    terminate(&mut child).await;
                    return Ok(ExitState::Cancelled);
                }
            }
        }

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = cancel.cancelled() => {
                terminate(&mut child).await;
                return Ok(ExitState::Cancelled);
            }
        };

        Ok(match status.code() {
            Some(code) => ExitState::Exited(code),
            None => ExitState::Signalled,
        })
    }
}

/// Asks the child to stop, then kills it if it ignores the request.
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                Ok(()) => {
                    if let Ok(Ok(_)) = tokio::time::timeout(KILL_GRACE, child.wait()).await {
                        return;
                    }
                }
                Err(e) => warn!(pid, error = %e, "Failed to send SIGTERM to rclone"),
            }
        }
    }

    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill rclone");
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let line = String::from_utf8_lossy(bytes);
    line.trim_end_matches('\r').to_string()
}

fn quote(part: &str) -> String {
    if !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_=./:@%+,".contains(c))
    {
        part.to_string()
    } else {
        format!("'{}'", part.replace('\'', r"'\''"))
    }
}
