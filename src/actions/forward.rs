//! Trap forwarding
//!
//! Re-emits the raw PDU bytes of each trap over UDP to a configured
//! destination. The bytes pass through untouched; the receiving collector
//! decodes them the same way this daemon's own decoder did.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::info;

use crate::trap::TrapRecord;

use super::ActionPlugin;

pub struct TrapForwarder {
    socket: Option<UdpSocket>,
    target: String,
}

impl TrapForwarder {
    pub fn new() -> Self {
        Self {
            socket: None,
            target: String::new(),
        }
    }
}

impl Default for TrapForwarder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActionPlugin for TrapForwarder {
    async fn configure(&mut self, args: &HashMap<String, String>) -> Result<()> {
        let host = args
            .get("hostname")
            .filter(|h| !h.is_empty())
            .context("forward action requires a hostname argument")?;
        let port: u16 = args
            .get("port")
            .context("forward action requires a port argument")?
            .parse()
            .context("invalid destination port for forward action")?;

        let target = format!("{host}:{port}");
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("unable to open forwarding socket")?;
        socket
            .connect(&target)
            .await
            .with_context(|| format!("unable to set forward destination {target}"))?;

        info!(target = %target, "added trap forwarding destination");
        self.target = target;
        self.socket = Some(socket);
        Ok(())
    }

    async fn process_trap(&self, trap: &TrapRecord) -> Result<()> {
        let socket = match &self.socket {
            Some(s) => s,
            None => bail!("forward action used before configure"),
        };
        if trap.raw_pdu.is_empty() {
            bail!("trap #{} carries no raw PDU to forward", trap.sequence);
        }
        socket
            .send(&trap.raw_pdu)
            .await
            .with_context(|| format!("unable to forward trap to {}", self.target))?;
        Ok(())
    }
}
