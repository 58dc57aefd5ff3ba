//! Server configuration.

use crate::params::Network;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tunables for the peer-to-peer server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Network to join.
    #[serde(default)]
    pub network: Network,
    /// Listen addresses in `host:port` form.
    #[serde(default)]
    pub listeners: Vec<String>,
    /// Externally reachable addresses to advertise. Setting any disables
    /// automatic local address discovery.
    #[serde(default)]
    pub external_ips: Vec<String>,
    /// Whitelisted subnets in CIDR notation. Whitelisted inbound peers are
    /// exempt from banning and the peer limits.
    #[serde(default)]
    pub whitelists: Vec<String>,
    /// Peers to maintain persistent connections to. When non-empty the
    /// server runs in connect-only mode.
    #[serde(default)]
    pub connect_peers: Vec<String>,
    /// Additional persistent peers.
    #[serde(default)]
    pub add_peers: Vec<String>,
    /// Maximum number of peers.
    #[serde(default = "default_max_peers")]
    pub max_peers: usize,
    /// Maximum number of connections sharing one IP. Zero disables the
    /// limit.
    #[serde(default = "default_max_same_ip")]
    pub max_same_ip: usize,
    /// Number of outbound peers to target.
    #[serde(default = "default_target_outbound")]
    pub target_outbound: usize,
    /// Ban score threshold above which a peer is banned and disconnected.
    #[serde(default = "default_ban_threshold")]
    pub ban_threshold: u32,
    /// How long a banned host stays banned, in seconds.
    #[serde(default = "default_ban_duration_secs")]
    pub ban_duration_secs: u64,
    /// Disable misbehavior banning entirely.
    #[serde(default)]
    pub disable_banning: bool,
    /// Reject all transaction relay; announced transactions disconnect the
    /// announcing peer.
    #[serde(default)]
    pub blocks_only: bool,
    /// Do not advertise or serve committed filters.
    #[serde(default)]
    pub no_cfilters: bool,
    /// Do not accept inbound connections.
    #[serde(default)]
    pub disable_listen: bool,
    /// Skip DNS seeding of the address manager.
    #[serde(default)]
    pub disable_dns_seed: bool,
    /// Disable automatic local address discovery from peer-reported hints.
    #[serde(default)]
    pub no_discover_ip: bool,
    /// Map the listen port via UPnP.
    #[serde(default)]
    pub upnp: bool,
    /// Proxy used for outbound connections. Setting one disables local
    /// address discovery.
    #[serde(default)]
    pub proxy: Option<String>,
}

fn default_max_peers() -> usize {
    125
}

fn default_max_same_ip() -> usize {
    5
}

fn default_target_outbound() -> usize {
    8
}

fn default_ban_threshold() -> u32 {
    100
}

fn default_ban_duration_secs() -> u64 {
    60 * 60 * 24
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            network: Network::Mainnet,
            listeners: Vec::new(),
            external_ips: Vec::new(),
            whitelists: Vec::new(),
            connect_peers: Vec::new(),
            add_peers: Vec::new(),
            max_peers: default_max_peers(),
            max_same_ip: default_max_same_ip(),
            target_outbound: default_target_outbound(),
            ban_threshold: default_ban_threshold(),
            ban_duration_secs: default_ban_duration_secs(),
            disable_banning: false,
            blocks_only: false,
            no_cfilters: false,
            disable_listen: false,
            disable_dns_seed: false,
            no_discover_ip: false,
            upnp: false,
            proxy: None,
        }
    }
}

impl ServerConfig {
    /// Ban duration as a [`Duration`].
    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.ban_duration_secs)
    }

    /// Whether the server runs on the simulation network.
    pub fn simnet(&self) -> bool {
        self.network == Network::Simnet
    }
}
