//! Matcher primitives
//!
//! A matcher is a single-field predicate over a trap. All values are parsed
//! and compiled when the configuration snapshot is assembled, so evaluating
//! a matcher can never fail and never parses.

use std::net::IpAddr;
use std::sync::Arc;

use ipnetwork::IpNetwork;
use regex::Regex;

use crate::ipset::IpSet;
use crate::trap::{SnmpVersion, TrapRecord};

/// Trap field a matcher applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapField {
    Version,
    SourceIp,
    AgentAddr,
    GenericType,
    SpecificType,
    EnterpriseOid,
}

impl TrapField {
    pub fn name(&self) -> &'static str {
        match self {
            TrapField::Version => "snmp_versions",
            TrapField::SourceIp => "source_ip",
            TrapField::AgentAddr => "agent_address",
            TrapField::GenericType => "generic_type",
            TrapField::SpecificType => "specific_type",
            TrapField::EnterpriseOid => "enterprise_oid",
        }
    }
}

/// Compiled predicate value
#[derive(Debug, Clone)]
pub enum MatchKind {
    VersionEq(SnmpVersion),
    IntEq(i32),
    Literal(String),
    /// Membership in a named set; the set reference is resolved at build time
    IpSet(String, Arc<IpSet>),
    Regex(Regex),
    Cidr(IpNetwork),
}

#[derive(Debug, Clone)]
pub struct Matcher {
    pub field: TrapField,
    pub kind: MatchKind,
}

impl Matcher {
    pub fn new(field: TrapField, kind: MatchKind) -> Self {
        Self { field, kind }
    }

    /// Evaluate this matcher against a trap.
    pub fn matches(&self, trap: &TrapRecord) -> bool {
        match self.field {
            TrapField::Version => match &self.kind {
                MatchKind::VersionEq(v) => *v == trap.version,
                _ => false,
            },
            TrapField::SourceIp => self.match_ip(trap.src_ip),
            TrapField::AgentAddr => self.match_ip(IpAddr::V4(trap.agent_addr)),
            TrapField::GenericType => match &self.kind {
                MatchKind::IntEq(v) => *v == trap.generic_trap,
                _ => false,
            },
            TrapField::SpecificType => match &self.kind {
                MatchKind::IntEq(v) => *v == trap.specific_trap,
                _ => false,
            },
            TrapField::EnterpriseOid => match &self.kind {
                MatchKind::Regex(re) => re.is_match(&trap.enterprise_oid),
                _ => false,
            },
        }
    }

    fn match_ip(&self, addr: IpAddr) -> bool {
        match &self.kind {
            MatchKind::Literal(s) => addr.to_string() == *s,
            MatchKind::IpSet(_, set) => set.contains(&addr.to_string()),
            MatchKind::Regex(re) => re.is_match(&addr.to_string()),
            MatchKind::Cidr(net) => net.contains(addr),
            _ => false,
        }
    }
}

// Snapshot idempotence is checked by comparing filter lists; regexes compare
// by pattern, IP sets by name and contents.
impl PartialEq for MatchKind {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (MatchKind::VersionEq(a), MatchKind::VersionEq(b)) => a == b,
            (MatchKind::IntEq(a), MatchKind::IntEq(b)) => a == b,
            (MatchKind::Literal(a), MatchKind::Literal(b)) => a == b,
            (MatchKind::IpSet(a, sa), MatchKind::IpSet(b, sb)) => a == b && sa == sb,
            (MatchKind::Regex(a), MatchKind::Regex(b)) => a.as_str() == b.as_str(),
            (MatchKind::Cidr(a), MatchKind::Cidr(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.field == other.field && self.kind == other.kind
    }
}
