//! Network parameters.
//!
//! Each network the daemon can join has a default port, DNS seeds for
//! bootstrapping the address manager, and the height at which stake voting
//! begins.

use serde::{Deserialize, Serialize};

/// The network a server instance participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
    /// Simulation network: connects only to explicitly specified peers and
    /// never advertises or learns addresses.
    Simnet,
    /// Regression test network.
    Regnet,
}

/// DNS seeds for mainnet.
const MAINNET_DNS_SEEDS: &[&str] = &[
    "seed1.aurumnetwork.org",
    "seed2.aurumnetwork.org",
    "seed.aurum.tools",
];

/// DNS seeds for testnet.
const TESTNET_DNS_SEEDS: &[&str] = &["testnet-seed.aurumnetwork.org"];

impl Network {
    /// Human-readable network name.
    pub fn name(&self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Simnet => "simnet",
            Network::Regnet => "regnet",
        }
    }

    /// Default P2P port.
    pub fn default_port(&self) -> u16 {
        match self {
            Network::Mainnet => 9108,
            Network::Testnet => 19108,
            Network::Simnet => 18555,
            Network::Regnet => 18655,
        }
    }

    /// DNS seeds used to bootstrap the address manager.
    pub fn dns_seeds(&self) -> &'static [&'static str] {
        match self {
            Network::Mainnet => MAINNET_DNS_SEEDS,
            Network::Testnet => TESTNET_DNS_SEEDS,
            // Private networks are never seeded.
            Network::Simnet | Network::Regnet => &[],
        }
    }

    /// Height at which stake validation begins. Below this height there are
    /// no votes and mining state requests receive an empty reply.
    pub fn stake_validation_height(&self) -> i64 {
        match self {
            Network::Mainnet => 4096,
            Network::Testnet => 768,
            Network::Simnet | Network::Regnet => 16,
        }
    }

    /// Whether this is a private (simulation or regression) network that
    /// must avoid address discovery.
    pub fn is_private(&self) -> bool {
        matches!(self, Network::Simnet | Network::Regnet)
    }
}
