//! Capture action
//!
//! Persists each trap to disk as JSON, one file per trap, in a form the
//! replay decoder can feed back through the daemon.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::info;

use crate::trap::TrapRecord;

use super::ActionPlugin;

pub struct TrapCapture {
    dir: PathBuf,
    file_expr: String,
    counter: AtomicU64,
}

impl TrapCapture {
    pub fn new() -> Self {
        Self {
            dir: PathBuf::new(),
            file_expr: String::new(),
            counter: AtomicU64::new(0),
        }
    }

    fn next_filename(&self) -> PathBuf {
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        self.dir.join(format!("{}-{n}.json", self.file_expr))
    }
}

impl Default for TrapCapture {
    fn default() -> Self {
        Self::new()
    }
}

const VALID_ARGS: &[&str] = &["dir", "file_expr"];

#[async_trait]
impl ActionPlugin for TrapCapture {
    async fn configure(&mut self, args: &HashMap<String, String>) -> Result<()> {
        for key in args.keys() {
            if !VALID_ARGS.contains(&key.as_str()) {
                bail!("unrecognized option to capture action: {key}");
            }
        }

        let dir = args
            .get("dir")
            .filter(|d| !d.is_empty())
            .context("capture action requires a dir argument")?;
        self.dir = PathBuf::from(dir);
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("unable to create capture directory {}", self.dir.display()))?;

        self.file_expr = args
            .get("file_expr")
            .cloned()
            .unwrap_or_else(|| "captureFile".to_string());

        info!(dir = %self.dir.display(), file_expr = %self.file_expr, "added capture destination");
        Ok(())
    }

    async fn process_trap(&self, trap: &TrapRecord) -> Result<()> {
        let path = self.next_filename();
        let json = serde_json::to_vec_pretty(trap)?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("unable to write capture file {}", path.display()))?;
        Ok(())
    }
}
