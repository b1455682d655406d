//! Dispatch engine
//!
//! Runs each trap through the published snapshot's filter chain in declared
//! order with short-circuit semantics. The snapshot pointer is the only
//! shared mutable cell: the reload coordinator stores it, dispatchers
//! acquire a stable reference for the lifetime of one dispatch.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::counters::{CounterId, TrapCounters};
use crate::filter::{Filter, FilterAction};
use crate::snapshot::EngineSnapshot;
use crate::trap::TrapRecord;

pub struct Engine {
    counters: TrapCounters,
    current: RwLock<Arc<EngineSnapshot>>,
}

impl Engine {
    pub fn new(initial: EngineSnapshot) -> Self {
        Self {
            counters: TrapCounters::new(),
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// Acquire the published snapshot. The returned reference stays valid
    /// (and its plugins open) until dropped, regardless of reloads.
    pub fn snapshot(&self) -> Arc<EngineSnapshot> {
        self.current.read().clone()
    }

    /// Atomically publish a new snapshot, returning the superseded one so
    /// the caller can drain and close it.
    pub fn publish(&self, next: EngineSnapshot) -> Arc<EngineSnapshot> {
        let mut guard = self.current.write();
        std::mem::replace(&mut *guard, Arc::new(next))
    }

    pub fn counters(&self) -> &TrapCounters {
        &self.counters
    }

    /// Increment a counter and fan it out to the snapshot's reporters.
    pub fn counter_inc(&self, snapshot: &EngineSnapshot, id: CounterId) {
        self.counters.inc(id);
        snapshot.report_inc(id);
    }

    /// Run one trap through the filter chain of `snapshot`.
    ///
    /// Once the trap is marked dropped no further filter runs. A failing
    /// plugin action fires every plugin-error filter concurrently against a
    /// frozen copy of the trap and the chain continues.
    pub async fn dispatch(&self, snapshot: &Arc<EngineSnapshot>, trap: &mut TrapRecord) {
        for filter in &snapshot.filters {
            if trap.dropped {
                continue;
            }
            if !filter.is_match(trap) {
                continue;
            }

            match &filter.action {
                FilterAction::Drop => {
                    trap.dropped = true;
                    self.counter_inc(snapshot, CounterId::Dropped);
                    continue;
                }
                FilterAction::Nat(ip) => {
                    debug!(
                        sequence = trap.sequence,
                        filter = filter.index,
                        agent = %ip,
                        "rewrote agent address"
                    );
                    trap.agent_addr = *ip;
                }
                FilterAction::Plugin(plugin) => {
                    if let Err(err) = plugin.process_trap(trap).await {
                        warn!(
                            sequence = trap.sequence,
                            filter = filter.index,
                            plugin = %filter.action_name,
                            error = %err,
                            "plugin action failed"
                        );
                        spawn_error_actions(snapshot, trap);
                    }
                }
            }

            if filter.break_after {
                trap.dropped = true;
                self.counter_inc(snapshot, CounterId::Dropped);
            }
        }
    }
}

/// Fire every plugin-error filter's action, each on its own task. Handlers
/// see the trap as it was when the failure happened and may outlive the
/// triggering dispatch; their own failures are logged and never cascade
/// further.
fn spawn_error_actions(snapshot: &Arc<EngineSnapshot>, trap: &TrapRecord) {
    if snapshot.plugin_error_filters.is_empty() {
        return;
    }
    let frozen = Arc::new(trap.clone());
    for index in 0..snapshot.plugin_error_filters.len() {
        let snapshot = Arc::clone(snapshot);
        let trap = Arc::clone(&frozen);
        tokio::spawn(async move {
            let filter = &snapshot.plugin_error_filters[index];
            if let Err(err) = run_error_action(filter, &trap).await {
                warn!(
                    sequence = trap.sequence,
                    plugin = %filter.action_name,
                    error = %err,
                    "plugin error action failed"
                );
            }
        });
    }
}

async fn run_error_action(filter: &Filter, trap: &TrapRecord) -> anyhow::Result<()> {
    match &filter.action {
        FilterAction::Plugin(plugin) => plugin.process_trap(trap).await,
        // Sentinels operate on a frozen copy; nothing to do.
        FilterAction::Drop | FilterAction::Nat(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::SocketAddr;
    use std::sync::Arc;

    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use crate::actions::ActionPlugin;
    use crate::trap::{DecodedTrap, SnmpVersion};

    /// Records every trap it sees.
    struct Recorder {
        seen: Arc<Mutex<Vec<TrapRecord>>>,
        notify: Option<mpsc::UnboundedSender<()>>,
    }

    #[async_trait]
    impl ActionPlugin for Recorder {
        async fn configure(&mut self, _args: &HashMap<String, String>) -> Result<()> {
            Ok(())
        }

        async fn process_trap(&self, trap: &TrapRecord) -> Result<()> {
            self.seen.lock().push(trap.clone());
            if let Some(tx) = &self.notify {
                let _ = tx.send(());
            }
            Ok(())
        }
    }

    /// Fails on every trap.
    struct AlwaysFails;

    #[async_trait]
    impl ActionPlugin for AlwaysFails {
        async fn configure(&mut self, _args: &HashMap<String, String>) -> Result<()> {
            Ok(())
        }

        async fn process_trap(&self, _trap: &TrapRecord) -> Result<()> {
            bail!("sink unavailable")
        }
    }

    fn match_all_filter(index: usize, name: &str, action: FilterAction, break_after: bool) -> Filter {
        Filter {
            index,
            matchers: Vec::new(),
            match_all: true,
            action_name: name.to_string(),
            action,
            break_after,
        }
    }

    fn version_filter(index: usize, version: SnmpVersion, action: FilterAction) -> Filter {
        use crate::matcher::{MatchKind, Matcher, TrapField};
        Filter {
            index,
            matchers: vec![Matcher::new(TrapField::Version, MatchKind::VersionEq(version))],
            match_all: false,
            action_name: "drop".to_string(),
            action,
            break_after: false,
        }
    }

    fn snapshot_with(filters: Vec<Filter>, error_filters: Vec<Filter>) -> EngineSnapshot {
        let mut snapshot = EngineSnapshot::empty();
        snapshot.filters = filters;
        snapshot.plugin_error_filters = error_filters;
        snapshot
    }

    fn trap(version: SnmpVersion, src: &str, agent: &str) -> TrapRecord {
        let decoded = DecodedTrap {
            version,
            varbinds: vec![],
            enterprise_oid: "1.3.6.1.4.1.9.1.1".to_string(),
            agent_addr: agent.parse().unwrap(),
            generic_trap: 6,
            specific_trap: 1,
            sys_uptime: 0,
            raw_pdu: vec![],
        };
        let peer: SocketAddr = format!("{src}:161").parse().unwrap();
        TrapRecord::from_decoded(decoded, peer, "host".to_string(), 1)
    }

    #[tokio::test]
    async fn test_zero_filters_leaves_trap_unchanged() {
        let engine = Engine::new(snapshot_with(vec![], vec![]));
        let snapshot = engine.snapshot();
        let mut t = trap(SnmpVersion::V1, "10.0.0.1", "10.0.0.2");
        let agent_before = t.agent_addr;
        engine.dispatch(&snapshot, &mut t).await;
        assert!(!t.dropped);
        assert_eq!(t.agent_addr, agent_before);
        assert_eq!(engine.counters().get(CounterId::Dropped), 0);
    }

    #[tokio::test]
    async fn test_match_all_drop_drops_every_trap() {
        let engine = Engine::new(snapshot_with(
            vec![match_all_filter(0, "drop", FilterAction::Drop, false)],
            vec![],
        ));
        let snapshot = engine.snapshot();
        for version in [SnmpVersion::V1, SnmpVersion::V2c, SnmpVersion::V3] {
            let mut t = trap(version, "10.0.0.1", "10.0.0.2");
            engine.dispatch(&snapshot, &mut t).await;
            assert!(t.dropped);
        }
        assert_eq!(engine.counters().get(CounterId::Dropped), 3);
    }

    #[tokio::test]
    async fn test_drop_by_version_short_circuits() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder: Arc<dyn ActionPlugin> = Arc::new(Recorder {
            seen: seen.clone(),
            notify: None,
        });
        let engine = Engine::new(snapshot_with(
            vec![
                version_filter(0, SnmpVersion::V1, FilterAction::Drop),
                match_all_filter(1, "record", FilterAction::Plugin(recorder), false),
            ],
            vec![],
        ));
        let snapshot = engine.snapshot();

        let mut v1 = trap(SnmpVersion::V1, "10.0.0.1", "10.0.0.2");
        engine.dispatch(&snapshot, &mut v1).await;
        assert!(v1.dropped);
        assert_eq!(engine.counters().get(CounterId::Dropped), 1);
        assert!(seen.lock().is_empty(), "no filter may run after a drop");

        let mut v2 = trap(SnmpVersion::V2c, "10.0.0.1", "10.0.0.2");
        engine.dispatch(&snapshot, &mut v2).await;
        assert!(!v2.dropped);
        assert_eq!(seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_nat_rewrite_visible_to_subsequent_filters() {
        use crate::matcher::{MatchKind, Matcher, TrapField};

        let seen = Arc::new(Mutex::new(Vec::new()));
        let recorder: Arc<dyn ActionPlugin> = Arc::new(Recorder {
            seen: seen.clone(),
            notify: None,
        });
        let nat_filter = Filter {
            index: 0,
            matchers: vec![Matcher::new(
                TrapField::AgentAddr,
                MatchKind::Literal("192.168.1.5".to_string()),
            )],
            match_all: false,
            action_name: "nat".to_string(),
            action: FilterAction::Nat("10.0.0.1".parse().unwrap()),
            break_after: false,
        };
        let engine = Engine::new(snapshot_with(
            vec![
                nat_filter,
                match_all_filter(1, "record", FilterAction::Plugin(recorder), false),
            ],
            vec![],
        ));
        let snapshot = engine.snapshot();

        let mut t = trap(SnmpVersion::V1, "10.9.9.9", "192.168.1.5");
        engine.dispatch(&snapshot, &mut t).await;
        assert!(!t.dropped);
        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].agent_addr, "10.0.0.1".parse::<std::net::Ipv4Addr>().unwrap());
    }

    #[tokio::test]
    async fn test_break_after_drops_after_action() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let first: Arc<dyn ActionPlugin> = Arc::new(Recorder {
            seen: seen.clone(),
            notify: None,
        });
        let second_seen = Arc::new(Mutex::new(Vec::new()));
        let second: Arc<dyn ActionPlugin> = Arc::new(Recorder {
            seen: second_seen.clone(),
            notify: None,
        });
        let engine = Engine::new(snapshot_with(
            vec![
                match_all_filter(0, "log", FilterAction::Plugin(first), true),
                match_all_filter(1, "record", FilterAction::Plugin(second), false),
            ],
            vec![],
        ));
        let snapshot = engine.snapshot();

        let mut t = trap(SnmpVersion::V2c, "5.6.7.8", "5.6.7.8");
        engine.dispatch(&snapshot, &mut t).await;
        assert!(t.dropped);
        assert_eq!(seen.lock().len(), 1);
        assert!(second_seen.lock().is_empty());
        assert_eq!(engine.counters().get(CounterId::Dropped), 1);
    }

    #[tokio::test]
    async fn test_plugin_error_fires_error_filters_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let error_sink: Arc<dyn ActionPlugin> = Arc::new(Recorder {
            seen: seen.clone(),
            notify: Some(tx),
        });
        let failing: Arc<dyn ActionPlugin> = Arc::new(AlwaysFails);

        let engine = Engine::new(snapshot_with(
            vec![match_all_filter(0, "plugin_x", FilterAction::Plugin(failing), false)],
            vec![match_all_filter(0, "log_err", FilterAction::Plugin(error_sink), false)],
        ));
        let snapshot = engine.snapshot();

        let mut t = trap(SnmpVersion::V2c, "10.0.0.1", "10.0.0.2");
        engine.dispatch(&snapshot, &mut t).await;
        // Dispatch completes without waiting for the handler; join it here.
        tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("error filter did not run")
            .unwrap();
        assert_eq!(seen.lock().len(), 1);
        assert!(!t.dropped);
    }

    #[tokio::test]
    async fn test_failing_error_filter_does_not_recurse() {
        let failing: Arc<dyn ActionPlugin> = Arc::new(AlwaysFails);
        let failing_err: Arc<dyn ActionPlugin> = Arc::new(AlwaysFails);
        let engine = Engine::new(snapshot_with(
            vec![match_all_filter(0, "plugin_x", FilterAction::Plugin(failing), false)],
            vec![match_all_filter(0, "log_err", FilterAction::Plugin(failing_err), false)],
        ));
        let snapshot = engine.snapshot();
        let mut t = trap(SnmpVersion::V2c, "10.0.0.1", "10.0.0.2");
        engine.dispatch(&snapshot, &mut t).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        // Nothing to assert beyond completion: the failure is logged, the
        // dispatch and the handler both terminate.
    }

    #[tokio::test]
    async fn test_publish_returns_superseded_snapshot() {
        let engine = Engine::new(snapshot_with(vec![], vec![]));
        let first = engine.snapshot();
        let old = engine.publish(snapshot_with(
            vec![match_all_filter(0, "drop", FilterAction::Drop, false)],
            vec![],
        ));
        assert!(Arc::ptr_eq(&first, &old));
        assert_eq!(engine.snapshot().filters.len(), 1);
    }
}
