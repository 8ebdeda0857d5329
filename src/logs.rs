//! Build log file management: per-job log files, the daemon's own system
//! log, and the retention sweep.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::warn;

/// Timestamp format shared by log file names and image tags.
pub const COMPACT_UTC_FORMAT: &str = "%Y%m%dT%H%M%SZ";

pub struct LogManager {
    log_dir: PathBuf,
}

impl LogManager {
    pub fn new(log_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(log_dir)
            .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
        Ok(Self {
            log_dir: log_dir.to_path_buf(),
        })
    }

    /// Create the log file for one job: `build-<jobId>-<timestamp>.log`.
    pub fn create_log_file(&self, job_id: &str) -> Result<(PathBuf, File)> {
        let ts = Utc::now().format(COMPACT_UTC_FORMAT);
        let log_path = self.log_dir.join(format!("build-{}-{}.log", job_id, ts));
        let file = File::create(&log_path)
            .with_context(|| format!("failed to create log file {}", log_path.display()))?;
        Ok((log_path, file))
    }

    /// Create the daemon's own log file: `system-<timestamp>.log`.
    pub fn create_system_log_file(&self) -> Result<(PathBuf, File)> {
        let ts = Utc::now().format(COMPACT_UTC_FORMAT);
        let log_path = self.log_dir.join(format!("system-{}.log", ts));
        let file = File::create(&log_path)
            .with_context(|| format!("failed to create system log file {}", log_path.display()))?;
        Ok((log_path, file))
    }

    pub fn read_log(&self, log_path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(log_path)
    }

    /// Delete log files older than `max_age`.
    pub fn cleanup(&self, max_age: Duration) -> Result<()> {
        let entries = std::fs::read_dir(&self.log_dir)
            .with_context(|| format!("failed to read log directory {}", self.log_dir.display()))?;

        for entry in entries.filter_map(|entry| entry.ok()) {
            let path = entry.path();
            if path.is_dir() {
                continue;
            }
            let modified = match entry.metadata().and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "could not stat log file");
                    continue;
                }
            };
            let age = match modified.elapsed() {
                Ok(age) => age,
                Err(_) => continue,
            };
            if age > max_age {
                if let Err(err) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), error = %err, "could not delete old log file");
                }
            }
        }
        Ok(())
    }
}
