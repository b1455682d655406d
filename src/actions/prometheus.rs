//! Prometheus metric reporting
//!
//! Publishes the trap counters through the `metrics` facade. The exporter
//! HTTP listener is installed once at daemon startup; this plugin only
//! registers counter metadata and drives increments, so reloads can rebuild
//! it freely.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use metrics::{counter, describe_counter};

use crate::counters::{CounterDef, CounterId};

use super::MetricPlugin;

pub struct PrometheusReporter {
    defs: Vec<CounterDef>,
}

impl PrometheusReporter {
    pub fn new() -> Self {
        Self { defs: Vec::new() }
    }
}

impl Default for PrometheusReporter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricPlugin for PrometheusReporter {
    async fn configure(
        &mut self,
        _args: &HashMap<String, String>,
        counters: &[CounterDef],
    ) -> Result<()> {
        for def in counters {
            describe_counter!(def.name, def.help);
            counter!(def.name).absolute(0);
        }
        self.defs = counters.to_vec();
        Ok(())
    }

    fn inc(&self, id: CounterId) {
        if let Some(def) = self.defs.iter().find(|d| d.id == id) {
            counter!(def.name).increment(1);
        }
    }
}
