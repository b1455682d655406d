//! File logging action
//!
//! Appends a human-readable entry per trap to a log file, rotating by size
//! with a bounded number of numbered backups. SIGUSR2 forces a rotation
//! regardless of size.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::trap::TrapRecord;

use super::ActionPlugin;

struct LogState {
    file: Option<File>,
    written: u64,
}

pub struct TrapLogger {
    path: PathBuf,
    max_bytes: u64,
    max_backups: u32,
    state: Mutex<LogState>,
}

impl TrapLogger {
    pub fn new() -> Self {
        Self {
            path: PathBuf::new(),
            max_bytes: 0,
            max_backups: 0,
            state: Mutex::new(LogState {
                file: None,
                written: 0,
            }),
        }
    }

    /// Shift numbered backups up and move the live file to `.1`.
    fn rotate_locked(&self, state: &mut LogState) -> Result<()> {
        state.file = None;
        state.written = 0;

        if self.max_backups > 0 {
            let overflow = backup_path(&self.path, self.max_backups);
            if overflow.exists() {
                std::fs::remove_file(&overflow)
                    .with_context(|| format!("unable to remove {}", overflow.display()))?;
            }
            for n in (1..self.max_backups).rev() {
                let from = backup_path(&self.path, n);
                if from.exists() {
                    let to = backup_path(&self.path, n + 1);
                    std::fs::rename(&from, &to)
                        .with_context(|| format!("unable to rotate {}", from.display()))?;
                }
            }
            if self.path.exists() {
                std::fs::rename(&self.path, backup_path(&self.path, 1))
                    .with_context(|| format!("unable to rotate {}", self.path.display()))?;
            }
        } else if self.path.exists() {
            std::fs::remove_file(&self.path)
                .with_context(|| format!("unable to truncate {}", self.path.display()))?;
        }
        Ok(())
    }

    fn write_entry(&self, entry: &str) -> Result<()> {
        let mut state = self.state.lock();
        if state.written + entry.len() as u64 > self.max_bytes && state.written > 0 {
            self.rotate_locked(&mut state)?;
        }
        if state.file.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .with_context(|| format!("unable to open log file {}", self.path.display()))?;
            state.written = file.metadata().map(|m| m.len()).unwrap_or(0);
            state.file = Some(file);
        }
        if let Some(file) = state.file.as_mut() {
            file.write_all(entry.as_bytes())?;
            file.write_all(b"\n")?;
            state.written += entry.len() as u64 + 1;
        }
        Ok(())
    }
}

impl Default for TrapLogger {
    fn default() -> Self {
        Self::new()
    }
}

fn backup_path(path: &PathBuf, n: u32) -> PathBuf {
    let mut os = path.clone().into_os_string();
    os.push(format!(".{n}"));
    PathBuf::from(os)
}

#[async_trait]
impl ActionPlugin for TrapLogger {
    async fn configure(&mut self, args: &HashMap<String, String>) -> Result<()> {
        let file = args
            .get("file")
            .filter(|f| !f.is_empty())
            .context("logfile action requires a file argument")?;
        self.path = PathBuf::from(file);

        let max_size_mb: u64 = match args.get("max_size_mb") {
            Some(v) => v.parse().context("invalid max_size_mb for logfile action")?,
            None => 1024,
        };
        if max_size_mb == 0 {
            bail!("max_size_mb for logfile action must be at least 1");
        }
        self.max_bytes = max_size_mb * 1024 * 1024;

        self.max_backups = match args.get("max_backups") {
            Some(v) => v.parse().context("invalid max_backups for logfile action")?,
            None => 7,
        };

        info!(file = %self.path.display(), "added trap log destination");
        Ok(())
    }

    async fn process_trap(&self, trap: &TrapRecord) -> Result<()> {
        self.write_entry(&trap.log_entry())
    }

    async fn sigusr2(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.rotate_locked(&mut state)
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(file) = state.file.take() {
            if let Err(err) = file.sync_all() {
                warn!(error = %err, file = %self.path.display(), "log file sync failed on close");
            }
        }
        Ok(())
    }
}
