//! Signal wiring
//!
//! SIGHUP reloads the configuration, SIGUSR2 asks every action plugin to
//! rotate its outputs, SIGUSR1 is passed through to plugins that care.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use crate::reload::ReloadCoordinator;

/// Install the signal handlers on a background task.
pub fn spawn_handlers(coordinator: Arc<ReloadCoordinator>) -> Result<()> {
    let mut hangup = signal(SignalKind::hangup()).context("unable to install SIGHUP handler")?;
    let mut usr1 =
        signal(SignalKind::user_defined1()).context("unable to install SIGUSR1 handler")?;
    let mut usr2 =
        signal(SignalKind::user_defined2()).context("unable to install SIGUSR2 handler")?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = hangup.recv() => {
                    info!("got SIGHUP - reloading configuration");
                    coordinator.reload_or_keep().await;
                }
                _ = usr1.recv() => {
                    info!("got SIGUSR1");
                    coordinator.signal_usr1().await;
                }
                _ = usr2.recv() => {
                    info!("got SIGUSR2 - rotating plugin outputs");
                    coordinator.rotate().await;
                }
            }
        }
    });

    Ok(())
}
