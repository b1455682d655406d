//! Trap counters
//!
//! Process-wide atomic counters incremented by the listener adapter and the
//! dispatch engine. Every increment is also fanned out to the reporting
//! plugins of the snapshot that observed it.

use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterId {
    /// Every trap received, before any checks
    Total,
    /// Traps whose version was in the ignored set
    Ignored,
    /// Traps submitted to the filter chain
    Handled,
    /// Traps dropped by a break/drop action or break-after flag
    Dropped,
    V1,
    V2c,
    V3,
}

#[derive(Debug, Clone, Copy)]
pub struct CounterDef {
    pub id: CounterId,
    pub name: &'static str,
    pub help: &'static str,
}

pub const COUNTER_DEFS: &[CounterDef] = &[
    CounterDef {
        id: CounterId::Total,
        name: "trapmux_traps_total",
        help: "Total number of traps received",
    },
    CounterDef {
        id: CounterId::Ignored,
        name: "trapmux_traps_ignored",
        help: "Traps ignored because of their SNMP version",
    },
    CounterDef {
        id: CounterId::Handled,
        name: "trapmux_traps_handled",
        help: "Traps submitted to the filter chain",
    },
    CounterDef {
        id: CounterId::Dropped,
        name: "trapmux_traps_dropped",
        help: "Traps dropped by a filter action",
    },
    CounterDef {
        id: CounterId::V1,
        name: "trapmux_traps_v1",
        help: "SNMP v1 traps received",
    },
    CounterDef {
        id: CounterId::V2c,
        name: "trapmux_traps_v2c",
        help: "SNMP v2c traps received",
    },
    CounterDef {
        id: CounterId::V3,
        name: "trapmux_traps_v3",
        help: "SNMP v3 traps received",
    },
];

/// Atomic counter block, shared by all dispatches.
#[derive(Debug, Default)]
pub struct TrapCounters {
    total: AtomicU64,
    ignored: AtomicU64,
    handled: AtomicU64,
    dropped: AtomicU64,
    v1: AtomicU64,
    v2c: AtomicU64,
    v3: AtomicU64,
}

impl TrapCounters {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, id: CounterId) -> &AtomicU64 {
        match id {
            CounterId::Total => &self.total,
            CounterId::Ignored => &self.ignored,
            CounterId::Handled => &self.handled,
            CounterId::Dropped => &self.dropped,
            CounterId::V1 => &self.v1,
            CounterId::V2c => &self.v2c,
            CounterId::V3 => &self.v3,
        }
    }

    pub fn inc(&self, id: CounterId) {
        self.cell(id).fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, id: CounterId) -> u64 {
        self.cell(id).load(Ordering::Relaxed)
    }
}
