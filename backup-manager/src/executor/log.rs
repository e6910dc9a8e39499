//! Per-backup-set log files.
//!
//! Each set appends to `<log_dir>/<name>.log`: one line per rclone output
//! line, framed by timestamped start and finish markers.

use super::progress::format_duration;
use crate::models::JobStatus;
use chrono::{DateTime, Local, Utc};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct JobLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JobLog {
    /// Opens (or creates) the log for `set_name` in append mode.
    pub fn open(dir: &Path, set_name: &str) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = Self::path_for(dir, set_name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path_for(dir: &Path, set_name: &str) -> PathBuf {
        dir.join(format!("{}.log", sanitize_file_name(set_name)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }

    pub fn started(&mut self, at: DateTime<Utc>, command_line: &str, dry_run: bool) -> io::Result<()> {
        let mode = if dry_run { " (dry run)" } else { "" };
        self.write_line(&format!("[{}] === Backup started{mode} ===", stamp(at)))?;
        self.write_line(&format!("[{}] Command: {command_line}", stamp(at)))
    }

    pub fn finished(
        &mut self,
        at: DateTime<Utc>,
        elapsed: std::time::Duration,
        status: JobStatus,
        exit_code: Option<i32>,
    ) -> io::Result<()> {
        let code = exit_code.map_or_else(|| "none".to_string(), |c| c.to_string());
        self.write_line(&format!(
            "[{}] === Backup finished: {status} (duration: {}, exit code: {code}) ===",
            stamp(at),
            format_duration(elapsed),
        ))
    }
}

/// Returns up to the last `count` lines of the log at `path`.
pub fn tail(path: &Path, count: usize) -> io::Result<Vec<String>> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = VecDeque::with_capacity(count.min(4096));
    for line in reader.split(b'\n') {
        let line = String::from_utf8_lossy(&line?).into_owned();
        if lines.len() == count {
            lines.pop_front();
        }
        if count > 0 {
            lines.push_back(line);
        }
    }
    Ok(lines.into())
}

/// Maps a backup set name onto a safe file stem.
///
/// Letters, digits, `-` and `_` are kept; every other byte is written as
/// `%XX`. Distinct names always give distinct stems.
pub fn sanitize_file_name(name: &str) -> String {
    if name.is_empty() {
        return "%".to_string();
    }
    let mut stem = String::with_capacity(name.len());
    for c in name.chars() {
        if c.is_alphanumeric() || matches!(c, '-' | '_') {
            stem.push(c);
        } else {
            let mut buf = [0u8; 4];
            for byte in c.encode_utf8(&mut buf).bytes() {
                stem.push_str(&format!("%{byte:02X}"));
            }
        }
    }
    stem
}

fn stamp(at: DateTime<Utc>) -> String {
    at.with_timezone(&Local).format(TIMESTAMP_FORMAT).to_string()
}
