//! Reload coordination
//!
//! Rebuilds the engine snapshot from the configuration source on the reload
//! signal and swaps it in atomically. A failed rebuild leaves the live
//! snapshot untouched. The superseded snapshot is closed only after every
//! in-flight dispatch (and orphan error handler) has released it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::actions::PluginRegistry;
use crate::config::{self, ConfigSource, Overrides};
use crate::engine::Engine;
use crate::filter::FilterAction;
use crate::secrets::SecretResolver;
use crate::snapshot::{self, EngineSnapshot};

pub struct ReloadCoordinator {
    engine: Arc<Engine>,
    source: ConfigSource,
    overrides: Overrides,
    registry: Arc<PluginRegistry>,
    secrets: Arc<dyn SecretResolver>,
}

impl ReloadCoordinator {
    pub fn new(
        engine: Arc<Engine>,
        source: ConfigSource,
        overrides: Overrides,
        registry: Arc<PluginRegistry>,
        secrets: Arc<dyn SecretResolver>,
    ) -> Self {
        Self {
            engine,
            source,
            overrides,
            registry,
            secrets,
        }
    }

    /// Rebuild and publish. All-or-nothing: any failure keeps the live
    /// snapshot serving.
    pub async fn reload(&self) -> Result<()> {
        info!(configuration = %self.source.describe(), "reloading configuration");
        let mut raw = config::load_document(&self.source).await?;
        config::apply_overrides(&mut raw, &self.overrides);
        let next = snapshot::build_snapshot(&raw, &self.registry, self.secrets.as_ref()).await?;

        let superseded = self.engine.publish(next);
        tokio::spawn(drain_and_close(superseded));
        info!("configuration reloaded");
        Ok(())
    }

    /// Reload, logging failure instead of propagating it. Wired to SIGHUP.
    pub async fn reload_or_keep(&self) {
        if let Err(err) = self.reload().await {
            error!(error = %err, "error parsing configuration; configuration was not changed");
        }
    }

    /// Invoke `sigusr1` on every bound action plugin of the live snapshot.
    pub async fn signal_usr1(&self) {
        self.for_each_plugin(|name, res| {
            if let Err(err) = res {
                warn!(plugin = %name, error = %err, "sigusr1 handler failed");
            }
        }, Signal::Usr1)
        .await;
    }

    /// Invoke `sigusr2` on every bound action plugin of the live snapshot.
    /// Wired to the rotate signal; performs no reconfiguration.
    pub async fn rotate(&self) {
        self.for_each_plugin(|name, res| {
            if let Err(err) = res {
                warn!(plugin = %name, error = %err, "rotate handler failed");
            }
        }, Signal::Usr2)
        .await;
    }

    async fn for_each_plugin<F>(&self, mut on_result: F, signal: Signal)
    where
        F: FnMut(&str, Result<()>),
    {
        let snapshot = self.engine.snapshot();
        for filter in snapshot.filters.iter().chain(&snapshot.plugin_error_filters) {
            if let FilterAction::Plugin(plugin) = &filter.action {
                let res = match signal {
                    Signal::Usr1 => plugin.sigusr1().await,
                    Signal::Usr2 => plugin.sigusr2().await,
                };
                on_result(&filter.action_name, res);
            }
        }
    }

    /// Swap in an empty snapshot and close the previous one after drain.
    /// Used at shutdown.
    pub async fn shutdown(&self) {
        let superseded = self.engine.publish(EngineSnapshot::empty());
        drain_and_close(superseded).await;
    }
}

#[derive(Clone, Copy)]
enum Signal {
    Usr1,
    Usr2,
}

/// Wait until no dispatch (or error handler) still holds the snapshot, then
/// close its plugins exactly once.
pub async fn drain_and_close(superseded: Arc<EngineSnapshot>) {
    let mut superseded = superseded;
    loop {
        match Arc::try_unwrap(superseded) {
            Ok(snapshot) => {
                snapshot.close().await;
                return;
            }
            Err(still_shared) => {
                superseded = still_shared;
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        }
    }
}
