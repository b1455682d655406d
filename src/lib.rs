//! trapmux - SNMP trap multiplexer
//!
//! A long-running daemon that receives SNMP v1/v2c/v3 traps over UDP and
//! routes each one through an ordered chain of filters. A filter matches on
//! trap metadata (version, source IP, agent address, trap types, enterprise
//! OID) and binds an action: drop the trap, rewrite its agent address,
//! forward it, log it, or hand it to a plugin. Configuration reloads are
//! atomic and never lose in-flight traps.

pub mod actions;
pub mod config;
pub mod counters;
pub mod engine;
pub mod filter;
pub mod ipset;
pub mod listener;
pub mod matcher;
pub mod reload;
pub mod secrets;
pub mod signals;
pub mod snapshot;
pub mod trap;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;

use actions::PluginRegistry;
use config::{ConfigSource, Overrides};
use engine::Engine;
use listener::{TrapDecoder, TrapListener};
use reload::ReloadCoordinator;
use secrets::SecretResolver;

/// The assembled daemon: engine, listener and reload coordinator wired
/// together.
pub struct Daemon {
    engine: Arc<Engine>,
    listener: TrapListener,
    coordinator: Arc<ReloadCoordinator>,
}

impl Daemon {
    /// Load the configuration, assemble the first snapshot and wire the
    /// components. Any configuration error here is fatal.
    pub async fn start(
        source: ConfigSource,
        overrides: Overrides,
        registry: PluginRegistry,
        secrets: Arc<dyn SecretResolver>,
        decoder: Arc<dyn TrapDecoder>,
    ) -> Result<Self> {
        info!(configuration = %source.describe(), "loading configuration");
        let mut raw = config::load_document(&source).await?;
        config::apply_overrides(&mut raw, &overrides);

        if raw.general.prometheus_enabled {
            let addr: SocketAddr =
                format!("{}:{}", raw.general.prometheus_ip, raw.general.prometheus_port)
                    .parse()
                    .context("invalid prometheus listen address")?;
            PrometheusBuilder::new()
                .with_http_listener(addr)
                .install()
                .context("unable to start prometheus exporter")?;
            info!(listen_address = %addr, "prometheus exporter started");
        }

        let registry = Arc::new(registry);
        let first = snapshot::build_snapshot(&raw, &registry, secrets.as_ref()).await?;
        let engine = Arc::new(Engine::new(first));

        let coordinator = Arc::new(ReloadCoordinator::new(
            engine.clone(),
            source,
            overrides,
            registry,
            secrets,
        ));
        signals::spawn_handlers(coordinator.clone())?;

        let listener = TrapListener::new(engine.clone(), decoder);

        Ok(Self {
            engine,
            listener,
            coordinator,
        })
    }

    /// Serve traps until the listener fails or the task is cancelled.
    pub async fn run(&self) -> Result<()> {
        self.listener.run().await
    }

    /// Close the live snapshot's plugins after in-flight dispatches drain.
    pub async fn shutdown(&self) {
        info!("shutting down");
        self.coordinator.shutdown().await;
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn coordinator(&self) -> &Arc<ReloadCoordinator> {
        &self.coordinator
    }
}
