//! Discard action

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::trap::TrapRecord;

use super::ActionPlugin;

/// Accepts every trap and does nothing with it.
pub struct Noop;

#[async_trait]
impl ActionPlugin for Noop {
    async fn configure(&mut self, _args: &HashMap<String, String>) -> Result<()> {
        Ok(())
    }

    async fn process_trap(&self, _trap: &TrapRecord) -> Result<()> {
        Ok(())
    }
}
