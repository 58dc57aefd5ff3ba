//! # aurum-server
//!
//! The peer-to-peer node server of the Aurum daemon.
//!
//! This crate provides:
//! - Peer lifecycle management (accept/dial, handshake gating, disconnect, ban)
//! - The central peer event loop serializing all registry mutations
//! - Inventory relay and periodic rebroadcast of unconfirmed inventory
//! - Decaying misbehavior scoring
//! - Per-peer wire-message handlers bridging to the chain, mempool, and
//!   committed-filter subsystems
//! - Peer-reported local address discovery
//!
//! The block chain, mempool, committed filter index, address manager, framed
//! peer codec, and connection manager are external collaborators accessed
//! through the traits in [`subsystems`] and [`transport`].

mod ban_score;
mod config;
mod error;
mod known_addrs;
mod params;
mod rebroadcast;
mod server;
mod session;
mod state;
pub mod subsystems;
pub mod transport;

#[cfg(test)]
pub(crate) mod testutil;

pub use ban_score::DynamicBanScore;
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult, SubsystemError};
pub use known_addrs::KnownAddressCache;
pub use params::Network;
pub use rebroadcast::random_uint16;
pub use server::{OutboundConn, RelayPayload, Server};
pub use session::PeerSession;
pub use transport::{PeerCodecConfig, PeerId};

use aurum_wire::ServiceFlags;

/// Services supported by the server by default.
pub const DEFAULT_SERVICES: ServiceFlags =
    ServiceFlags(ServiceFlags::NETWORK.0 | ServiceFlags::CF.0);

/// Services an outbound peer is required to advertise.
pub const DEFAULT_REQUIRED_SERVICES: ServiceFlags = ServiceFlags::NETWORK;

/// Highest protocol version the server speaks.
pub const MAX_PROTOCOL_VERSION: u32 = aurum_wire::NODE_CF_VERSION;

/// Maximum number of entries in the per-peer known address cache.
pub const MAX_KNOWN_ADDRS_PER_PEER: usize = 10_000;

/// User agent name sent to remote peers.
pub const USER_AGENT_NAME: &str = "aurumd";

/// User agent version sent to remote peers.
pub const USER_AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
