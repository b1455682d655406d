//! Filter records
//!
//! A filter is an ordered conjunction of matchers bound to one action. The
//! filter chain is evaluated in declaration order; a filter with no matchers
//! matches every trap.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use crate::actions::ActionPlugin;
use crate::matcher::Matcher;
use crate::trap::TrapRecord;

/// The bound action of a filter: a sentinel, or a configured plugin handle.
#[derive(Clone)]
pub enum FilterAction {
    /// Mark the trap dropped and terminate the chain (`break` / `drop`)
    Drop,
    /// Rewrite the trap's agent address, then continue
    Nat(Ipv4Addr),
    /// Hand the trap to a plugin
    Plugin(Arc<dyn ActionPlugin>),
}

impl fmt::Debug for FilterAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterAction::Drop => write!(f, "Drop"),
            FilterAction::Nat(ip) => write!(f, "Nat({ip})"),
            FilterAction::Plugin(_) => write!(f, "Plugin"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Filter {
    /// Position in the declared filter list, for diagnostics
    pub index: usize,
    pub matchers: Vec<Matcher>,
    /// True iff `matchers` is empty
    pub match_all: bool,
    pub action_name: String,
    pub action: FilterAction,
    /// Drop the trap after the action runs, terminating the chain
    pub break_after: bool,
}

impl Filter {
    /// True when every matcher accepts the trap. Short-circuits on the
    /// first non-matching predicate.
    pub fn is_match(&self, trap: &TrapRecord) -> bool {
        self.match_all || self.matchers.iter().all(|m| m.matches(trap))
    }
}

// Equality ignores the plugin handle identity: two assemblies of the same
// document compare equal even though their plugin instances differ.
impl PartialEq for Filter {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
            && self.matchers == other.matchers
            && self.match_all == other.match_all
            && self.action_name == other.action_name
            && self.break_after == other.break_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    use crate::matcher::{MatchKind, TrapField};
    use crate::trap::{DecodedTrap, SnmpVersion};

    fn trap(src: &str, version: SnmpVersion) -> TrapRecord {
        let decoded = DecodedTrap {
            version,
            varbinds: vec![],
            enterprise_oid: String::new(),
            agent_addr: "0.0.0.0".parse().unwrap(),
            generic_trap: 0,
            specific_trap: 0,
            sys_uptime: 0,
            raw_pdu: vec![],
        };
        let peer: SocketAddr = format!("{src}:161").parse().unwrap();
        TrapRecord::from_decoded(decoded, peer, "host".to_string(), 1)
    }

    fn filter(matchers: Vec<Matcher>) -> Filter {
        let match_all = matchers.is_empty();
        Filter {
            index: 0,
            matchers,
            match_all,
            action_name: "drop".to_string(),
            action: FilterAction::Drop,
            break_after: false,
        }
    }

    #[test]
    fn test_empty_matcher_list_matches_everything() {
        let f = filter(vec![]);
        assert!(f.match_all);
        assert!(f.is_match(&trap("10.0.0.1", SnmpVersion::V1)));
        assert!(f.is_match(&trap("192.168.0.9", SnmpVersion::V3)));
    }

    #[test]
    fn test_conjunction_requires_all_matchers() {
        let f = filter(vec![
            Matcher::new(TrapField::Version, MatchKind::VersionEq(SnmpVersion::V1)),
            Matcher::new(TrapField::SourceIp, MatchKind::Literal("10.0.0.1".to_string())),
        ]);
        assert!(f.is_match(&trap("10.0.0.1", SnmpVersion::V1)));
        assert!(!f.is_match(&trap("10.0.0.1", SnmpVersion::V2c)));
        assert!(!f.is_match(&trap("10.0.0.2", SnmpVersion::V1)));
    }
}
