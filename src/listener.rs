//! Trap listener
//!
//! Owns the UDP socket and the adapter between the wire decoder and the
//! dispatch engine. PDU decoding itself is an external concern behind
//! [`TrapDecoder`]; the in-tree [`ReplayDecoder`] understands the JSON
//! format written by the capture action.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::counters::CounterId;
use crate::engine::Engine;
use crate::trap::{DecodedTrap, SnmpVersion, TrapRecord};

/// Interface to the external SNMP wire decoder.
pub trait TrapDecoder: Send + Sync {
    fn decode(&self, datagram: &[u8], peer: SocketAddr) -> Result<DecodedTrap>;
}

/// Decodes the JSON trap format produced by the capture action. Useful for
/// replaying captured storms against a live daemon; production deployments
/// inject their PDU decoder instead.
#[derive(Debug, Default, Clone)]
pub struct ReplayDecoder;

impl TrapDecoder for ReplayDecoder {
    fn decode(&self, datagram: &[u8], _peer: SocketAddr) -> Result<DecodedTrap> {
        serde_json::from_slice(datagram).context("datagram is not a captured trap")
    }
}

pub struct TrapListener {
    engine: Arc<Engine>,
    decoder: Arc<dyn TrapDecoder>,
    sequence: AtomicU64,
}

impl TrapListener {
    pub fn new(engine: Arc<Engine>, decoder: Arc<dyn TrapDecoder>) -> Self {
        Self {
            engine,
            decoder,
            sequence: AtomicU64::new(0),
        }
    }

    /// Bind the listening socket and process datagrams until the task is
    /// cancelled. The socket stays open across configuration reloads.
    pub async fn run(&self) -> Result<()> {
        let params = self.engine.snapshot().listener.clone();
        let addr = format!("{}:{}", params.bind_addr, params.port);
        let socket = UdpSocket::bind(&addr)
            .await
            .with_context(|| format!("unable to listen on {addr}"))?;
        info!(listen_address = %addr, "trap listener started");

        let mut buf = vec![0u8; 65535];
        loop {
            let (len, peer) = socket
                .recv_from(&mut buf)
                .await
                .context("trap socket receive failed")?;
            match self.decoder.decode(&buf[..len], peer) {
                Ok(decoded) => self.handle_trap(decoded, peer).await,
                Err(err) => {
                    debug!(peer = %peer, error = %err, "undecodable datagram dropped");
                }
            }
        }
    }

    /// Adapter entry point: count the trap, enforce the ignored-version
    /// set, stamp receipt metadata and dispatch.
    pub async fn handle_trap(&self, decoded: DecodedTrap, peer: SocketAddr) {
        let snapshot = self.engine.snapshot();

        self.engine.counter_inc(&snapshot, CounterId::Total);
        let version_counter = match decoded.version {
            SnmpVersion::V1 => CounterId::V1,
            SnmpVersion::V2c => CounterId::V2c,
            SnmpVersion::V3 => CounterId::V3,
        };
        self.engine.counter_inc(&snapshot, version_counter);

        if snapshot.listener.is_ignored(decoded.version) {
            self.engine.counter_inc(&snapshot, CounterId::Ignored);
            return;
        }
        self.engine.counter_inc(&snapshot, CounterId::Handled);

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let mut trap = TrapRecord::from_decoded(
            decoded,
            peer,
            snapshot.listener.hostname.clone(),
            sequence,
        );

        if snapshot.logging.level == "debug" {
            debug!(trap = %trap.log_entry(), "raw trap");
        }

        self.engine.dispatch(&snapshot, &mut trap).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::filter::{Filter, FilterAction};
    use crate::snapshot::EngineSnapshot;

    fn decoded(version: SnmpVersion) -> DecodedTrap {
        DecodedTrap {
            version,
            varbinds: vec![],
            enterprise_oid: String::new(),
            agent_addr: "0.0.0.0".parse().unwrap(),
            generic_trap: 0,
            specific_trap: 0,
            sys_uptime: 0,
            raw_pdu: vec![],
        }
    }

    fn peer() -> SocketAddr {
        "10.0.0.1:161".parse().unwrap()
    }

    fn listener_with(snapshot: EngineSnapshot) -> TrapListener {
        TrapListener::new(
            Arc::new(Engine::new(snapshot)),
            Arc::new(ReplayDecoder),
        )
    }

    #[tokio::test]
    async fn test_counts_and_handles_traps() {
        let listener = listener_with(EngineSnapshot::empty());
        listener.handle_trap(decoded(SnmpVersion::V1), peer()).await;
        listener.handle_trap(decoded(SnmpVersion::V2c), peer()).await;
        listener.handle_trap(decoded(SnmpVersion::V2c), peer()).await;

        let counters = listener.engine.counters();
        assert_eq!(counters.get(CounterId::Total), 3);
        assert_eq!(counters.get(CounterId::V1), 1);
        assert_eq!(counters.get(CounterId::V2c), 2);
        assert_eq!(counters.get(CounterId::Handled), 3);
        assert_eq!(counters.get(CounterId::Ignored), 0);
    }

    #[tokio::test]
    async fn test_ignored_version_short_circuits() {
        let mut snapshot = EngineSnapshot::empty();
        snapshot.listener.ignored_versions = vec![SnmpVersion::V3];
        snapshot.filters = vec![Filter {
            index: 0,
            matchers: Vec::new(),
            match_all: true,
            action_name: "drop".to_string(),
            action: FilterAction::Drop,
            break_after: false,
        }];
        let listener = listener_with(snapshot);

        listener.handle_trap(decoded(SnmpVersion::V3), peer()).await;

        let counters = listener.engine.counters();
        assert_eq!(counters.get(CounterId::Total), 1);
        assert_eq!(counters.get(CounterId::V3), 1);
        assert_eq!(counters.get(CounterId::Ignored), 1);
        assert_eq!(counters.get(CounterId::Handled), 0);
        // The filter chain never saw the trap.
        assert_eq!(counters.get(CounterId::Dropped), 0);
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_monotonic() {
        let listener = listener_with(EngineSnapshot::empty());
        for _ in 0..3 {
            listener.handle_trap(decoded(SnmpVersion::V1), peer()).await;
        }
        assert_eq!(listener.sequence.load(Ordering::Relaxed), 3);
    }

    #[test]
    fn test_replay_decoder_roundtrip() {
        let original = decoded(SnmpVersion::V2c);
        let bytes = serde_json::to_vec(&original).unwrap();
        let back = ReplayDecoder.decode(&bytes, peer()).unwrap();
        assert_eq!(back.version, SnmpVersion::V2c);
        assert!(ReplayDecoder.decode(b"\x30\x82\x01", peer()).is_err());
    }
}
