//! Trap records
//!
//! The wire decoder hands the daemon a [`DecodedTrap`]; the listener adapter
//! stamps it with receipt metadata to produce the [`TrapRecord`] that flows
//! through the filter chain. Variable bindings are opaque to the engine and
//! are forwarded to actions untouched.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// SNMP protocol version of a received trap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnmpVersion {
    V1,
    V2c,
    V3,
}

impl SnmpVersion {
    /// Parse a configuration token. Accepted spellings are `v1`/`1`,
    /// `v2c`/`2c`/`2` and `v3`/`3`, case-insensitively.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_lowercase().as_str() {
            "v1" | "1" => Some(SnmpVersion::V1),
            "v2c" | "2c" | "2" => Some(SnmpVersion::V2c),
            "v3" | "3" => Some(SnmpVersion::V3),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SnmpVersion::V1 => "v1",
            SnmpVersion::V2c => "v2c",
            SnmpVersion::V3 => "v3",
        }
    }
}

impl fmt::Display for SnmpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single variable binding. The engine never interprets the value; it is
/// carried as decoded JSON so actions can render or re-serialize it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VarBind {
    pub oid: String,
    pub value: serde_json::Value,
}

/// A trap as supplied by the external wire decoder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecodedTrap {
    pub version: SnmpVersion,
    #[serde(default)]
    pub varbinds: Vec<VarBind>,
    /// Enterprise OID in dotted-decimal form (v1)
    #[serde(default)]
    pub enterprise_oid: String,
    /// Agent address field of the PDU (v1; may differ from the UDP peer)
    #[serde(default = "default_agent_addr")]
    pub agent_addr: Ipv4Addr,
    /// Generic trap type (v1, 0-6)
    #[serde(default)]
    pub generic_trap: i32,
    /// Specific trap type (v1)
    #[serde(default)]
    pub specific_trap: i32,
    /// sysUpTime from the PDU, in hundredths of a second
    #[serde(default)]
    pub sys_uptime: u32,
    /// Raw PDU bytes as they arrived on the wire. Forwarding actions re-emit
    /// these untouched.
    #[serde(default)]
    pub raw_pdu: Vec<u8>,
}

fn default_agent_addr() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

/// A trap in flight through the filter chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrapRecord {
    pub version: SnmpVersion,
    pub varbinds: Vec<VarBind>,
    pub enterprise_oid: String,
    pub agent_addr: Ipv4Addr,
    pub generic_trap: i32,
    pub specific_trap: i32,
    pub sys_uptime: u32,
    pub raw_pdu: Vec<u8>,
    /// UDP peer the trap arrived from
    pub src_ip: IpAddr,
    pub received_at: DateTime<Utc>,
    /// Hostname of this daemon, stamped for downstream consumers
    pub hostname: String,
    /// Monotonic sequence number across the daemon's lifetime
    pub sequence: u64,
    /// Once set, no further filter runs against this trap
    pub dropped: bool,
}

impl TrapRecord {
    pub fn from_decoded(decoded: DecodedTrap, peer: SocketAddr, hostname: String, sequence: u64) -> Self {
        Self {
            version: decoded.version,
            varbinds: decoded.varbinds,
            enterprise_oid: decoded.enterprise_oid,
            agent_addr: decoded.agent_addr,
            generic_trap: decoded.generic_trap,
            specific_trap: decoded.specific_trap,
            sys_uptime: decoded.sys_uptime,
            raw_pdu: decoded.raw_pdu,
            src_ip: peer.ip(),
            received_at: Utc::now(),
            hostname,
            sequence,
            dropped: false,
        }
    }

    /// Render the trap as a log entry. Used by the logfile action and by
    /// debug tracing of raw traps.
    pub fn log_entry(&self) -> String {
        let mut out = format!(
            "trap #{} [{}] {} src={} agent={} enterprise={} generic={} specific={} uptime={}",
            self.sequence,
            self.received_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.version,
            self.src_ip,
            self.agent_addr,
            self.enterprise_oid,
            self.generic_trap,
            self.specific_trap,
            self.sys_uptime,
        );
        for vb in &self.varbinds {
            out.push_str(&format!(" {}={}", vb.oid, vb.value));
        }
        out
    }
}
