//! In-memory peer registry.
//!
//! `PeerState` is owned exclusively by the peer event loop; all mutations of
//! the registry maps, the ban list, and the outbound group counters are
//! serialized through it. Only the address suggestion tallies carry a lock
//! because they are also read by the local-address resolver.

use crate::session::PeerSession;
use crate::subsystems::{AddrManager, LocalAddressPriority};
use crate::transport::PeerId;
use aurum_wire::{AddressFamily, ServiceFlags};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

/// Public network address suggestions reported by outbound peers, keyed by
/// host string, tallied per address family.
#[derive(Debug, Default)]
pub(crate) struct Suggestions {
    v4: HashMap<String, u32>,
    v6: HashMap<String, u32>,
}

impl Suggestions {
    fn family(&self, family: AddressFamily) -> &HashMap<String, u32> {
        match family {
            AddressFamily::V4 => &self.v4,
            AddressFamily::V6 => &self.v6,
        }
    }

    fn family_mut(&mut self, family: AddressFamily) -> &mut HashMap<String, u32> {
        match family {
            AddressFamily::V4 => &mut self.v4,
            AddressFamily::V6 => &mut self.v6,
        }
    }
}

/// State of all inbound, outbound, and persistent peers, banned hosts, and
/// outbound group counts.
pub(crate) struct PeerState {
    pub inbound_peers: HashMap<PeerId, Arc<PeerSession>>,
    pub outbound_peers: HashMap<PeerId, Arc<PeerSession>>,
    pub persistent_peers: HashMap<PeerId, Arc<PeerSession>>,
    /// Banned host -> ban expiry.
    pub banned: HashMap<String, Instant>,
    /// Network group key -> number of version-negotiated outbound peers.
    pub outbound_groups: HashMap<String, usize>,
    suggestions: Mutex<Suggestions>,
}

impl PeerState {
    pub fn new() -> Self {
        Self {
            inbound_peers: HashMap::new(),
            outbound_peers: HashMap::new(),
            persistent_peers: HashMap::new(),
            banned: HashMap::new(),
            outbound_groups: HashMap::new(),
            suggestions: Mutex::new(Suggestions::default()),
        }
    }

    /// Number of connections sharing the given IP.
    pub fn connections_with_ip(&self, ip: &IpAddr) -> usize {
        self.all_peers()
            .filter(|sp| sp.transport().net_address().ip == *ip)
            .count()
    }

    /// Count of all known peers.
    pub fn count(&self) -> usize {
        self.inbound_peers.len() + self.outbound_peers.len() + self.persistent_peers.len()
    }

    /// All outbound peers, persistent ones included.
    pub fn outbound_peers_iter(&self) -> impl Iterator<Item = &Arc<PeerSession>> {
        self.outbound_peers
            .values()
            .chain(self.persistent_peers.values())
    }

    /// All known peers.
    pub fn all_peers(&self) -> impl Iterator<Item = &Arc<PeerSession>> {
        self.inbound_peers.values().chain(self.outbound_peers_iter())
    }

    /// Tally a peer-reported external host for its address family.
    pub fn add_suggestion(&self, family: AddressFamily, host: String) {
        let mut suggestions = self.suggestions.lock();
        *suggestions.family_mut(family).entry(host).or_insert(0) += 1;
    }

    /// Promote the best suggested address for the given family into the
    /// address manager as a local address.
    ///
    /// A suggestion only qualifies once at least two outbound peers have
    /// reported the same host.
    pub fn resolve_local_address(
        &self,
        family: AddressFamily,
        addr_manager: &dyn AddrManager,
        services: ServiceFlags,
        port: u16,
    ) {
        let (best_suggestion, best_tally) = {
            let suggestions = self.suggestions.lock();
            let tallies = suggestions.family(family);
            if tallies.is_empty() {
                return;
            }

            let mut best_suggestion = String::new();
            let mut best_tally = 0u32;
            for (suggestion, &tally) in tallies {
                if best_suggestion.is_empty() || tally > best_tally {
                    best_suggestion = suggestion.clone();
                    best_tally = tally;
                }
            }
            (best_suggestion, best_tally)
        };

        if best_tally < 2 {
            return;
        }

        let na = match addr_manager.host_to_net_address(&best_suggestion, port, services) {
            Ok(na) => na,
            Err(e) => {
                error!(
                    host = %best_suggestion,
                    error = %e,
                    "unable to generate network address from suggestion"
                );
                return;
            }
        };

        if !addr_manager.has_local_address(&na) {
            if let Err(e) = addr_manager.add_local_address(na, LocalAddressPriority::Manual) {
                error!(error = %e, "unable to register suggested local address");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn suggestion_tally(&self, family: AddressFamily, host: &str) -> u32 {
        self.suggestions
            .lock()
            .family(family)
            .get(host)
            .copied()
            .unwrap_or(0)
    }
}
