//! CSV logging action
//!
//! Appends one comma-separated row per trap, suitable for spreadsheet
//! import or bulk loading into an analytics store.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::info;

use crate::trap::TrapRecord;

use super::ActionPlugin;

const HEADER: &str =
    "received_at,hostname,sequence,version,source_ip,agent_address,enterprise_oid,generic_trap,specific_trap,varbind_count";

pub struct TrapCsvLogger {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl TrapCsvLogger {
    pub fn new() -> Self {
        Self {
            path: PathBuf::new(),
            file: Mutex::new(None),
        }
    }

    fn row(trap: &TrapRecord) -> String {
        format!(
            "{},{},{},{},{},{},{},{},{},{}",
            trap.received_at.to_rfc3339(),
            trap.hostname,
            trap.sequence,
            trap.version,
            trap.src_ip,
            trap.agent_addr,
            trap.enterprise_oid,
            trap.generic_trap,
            trap.specific_trap,
            trap.varbinds.len(),
        )
    }
}

impl Default for TrapCsvLogger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionPlugin for TrapCsvLogger {
    async fn configure(&mut self, args: &HashMap<String, String>) -> Result<()> {
        let file = args
            .get("file")
            .filter(|f| !f.is_empty())
            .context("csv action requires a file argument")?;
        self.path = PathBuf::from(file);

        let new_file = !self.path.exists();
        let mut handle = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("unable to open CSV file {}", self.path.display()))?;
        if new_file {
            writeln!(handle, "{HEADER}")?;
        }
        *self.file.lock() = Some(handle);

        info!(file = %self.path.display(), "added CSV trap destination");
        Ok(())
    }

    async fn process_trap(&self, trap: &TrapRecord) -> Result<()> {
        let mut guard = self.file.lock();
        let file = guard
            .as_mut()
            .context("csv action used before configure")?;
        writeln!(file, "{}", Self::row(trap))
            .with_context(|| format!("unable to write CSV row to {}", self.path.display()))?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.file.lock().take();
        Ok(())
    }
}
