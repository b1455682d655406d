//! Named IP sets
//!
//! An IP set is a named, immutable collection of IPv4 literals that
//! `ipset:NAME` matchers test membership against. Sets are built once per
//! configuration snapshot and are read-only after publish.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::ConfigError;

pub type IpSet = HashSet<String>;

/// Accepts the dotted-quad shape only. Octet range (0-255) is deliberately
/// not enforced; addresses such as `999.1.1.1` pass and simply never match
/// a real peer.
pub fn is_ipv4_literal(s: &str) -> bool {
    let mut parts = 0;
    for part in s.split('.') {
        parts += 1;
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return false;
        }
    }
    parts == 4
}

/// Registry of named IP sets for one snapshot.
#[derive(Debug, Clone, Default)]
pub struct IpSetRegistry {
    sets: HashMap<String, Arc<IpSet>>,
}

impl IpSetRegistry {
    /// Build the registry from configuration stanzas. Each stanza maps set
    /// names to address lists; a malformed literal fails the whole build,
    /// naming the set and the address. A name declared twice keeps its last
    /// occurrence.
    pub fn from_stanzas(stanzas: &[HashMap<String, Vec<String>>]) -> Result<Self, ConfigError> {
        let mut sets = HashMap::new();
        for stanza in stanzas {
            for (name, addrs) in stanza {
                tracing::debug!(ipset = %name, count = addrs.len(), "loading IP set");
                let mut set = IpSet::with_capacity(addrs.len());
                for ip in addrs {
                    if !is_ipv4_literal(ip) {
                        return Err(ConfigError::BadIpSetAddress {
                            ipset: name.clone(),
                            ip: ip.clone(),
                        });
                    }
                    set.insert(ip.clone());
                }
                sets.insert(name.clone(), Arc::new(set));
            }
        }
        Ok(Self { sets })
    }

    pub fn get(&self, name: &str) -> Option<Arc<IpSet>> {
        self.sets.get(name).cloned()
    }

    pub fn contains_set(&self, name: &str) -> bool {
        self.sets.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }
}
