//! Action plugin host
//!
//! Filters bind either a sentinel action (`break`/`drop`, `nat`) or a named
//! plugin. Plugins are statically linked and resolved through a registry;
//! embedders and tests can register additional builders. A plugin is
//! configured exactly once during snapshot assembly and closed exactly once
//! during snapshot teardown.

pub mod capture;
pub mod csv;
pub mod forward;
pub mod logfile;
pub mod noop;
pub mod prometheus;

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;

use crate::counters::{CounterDef, CounterId};
use crate::trap::TrapRecord;

/// Capability set of a filter action plugin.
#[async_trait]
pub trait ActionPlugin: Send + Sync {
    /// Called exactly once, before any trap is processed. Arguments arrive
    /// with secret references already resolved to plaintext.
    async fn configure(&mut self, args: &HashMap<String, String>) -> Result<()>;

    /// Handle one trap. May be invoked concurrently across distinct traps.
    async fn process_trap(&self, trap: &TrapRecord) -> Result<()>;

    async fn sigusr1(&self) -> Result<()> {
        Ok(())
    }

    async fn sigusr2(&self) -> Result<()> {
        Ok(())
    }

    /// Called exactly once during snapshot teardown. Further calls after
    /// close are contract violations.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Capability set of a metric reporting plugin.
#[async_trait]
pub trait MetricPlugin: Send + Sync {
    async fn configure(&mut self, args: &HashMap<String, String>, counters: &[CounterDef])
        -> Result<()>;

    /// Must be cheap and non-blocking; called on the dispatch path.
    fn inc(&self, counter: CounterId);

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

type ActionBuilder = Box<dyn Fn() -> Box<dyn ActionPlugin> + Send + Sync>;
type MetricBuilder = Box<dyn Fn() -> Box<dyn MetricPlugin> + Send + Sync>;

/// Name-to-builder registry for statically linked plugins.
pub struct PluginRegistry {
    actions: HashMap<String, ActionBuilder>,
    metrics: HashMap<String, MetricBuilder>,
}

impl PluginRegistry {
    pub fn empty() -> Self {
        Self {
            actions: HashMap::new(),
            metrics: HashMap::new(),
        }
    }

    /// Registry with the built-in plugin set.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register_action("forward", || Box::new(forward::TrapForwarder::new()));
        registry.register_action("logfile", || Box::new(logfile::TrapLogger::new()));
        registry.register_action("csv", || Box::new(csv::TrapCsvLogger::new()));
        registry.register_action("capture", || Box::new(capture::TrapCapture::new()));
        registry.register_action("noop", || Box::new(noop::Noop));
        registry.register_metric("prometheus", || {
            Box::new(prometheus::PrometheusReporter::new())
        });
        registry
    }

    pub fn register_action<F>(&mut self, name: &str, builder: F)
    where
        F: Fn() -> Box<dyn ActionPlugin> + Send + Sync + 'static,
    {
        self.actions.insert(name.to_string(), Box::new(builder));
    }

    pub fn register_metric<F>(&mut self, name: &str, builder: F)
    where
        F: Fn() -> Box<dyn MetricPlugin> + Send + Sync + 'static,
    {
        self.metrics.insert(name.to_string(), Box::new(builder));
    }

    pub fn build_action(&self, name: &str) -> Option<Box<dyn ActionPlugin>> {
        self.actions.get(name).map(|b| b())
    }

    pub fn build_metric(&self, name: &str) -> Option<Box<dyn MetricPlugin>> {
        self.metrics.get(name).map(|b| b())
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
