//! # aurum-wire
//!
//! Wire protocol data model for the Aurum P2P network.
//!
//! This crate provides:
//! - Hashes, inventory vectors, and network addresses
//! - Service flags and protocol version constants
//! - The full message set exchanged between peers
//! - Transaction and block types, including the stake transaction kinds
//!
//! Byte-level framing, checksums, and the version/verack handshake are the
//! responsibility of the framed peer codec and are not part of this crate.

mod address;
mod hash;
mod inv;
mod message;
mod transaction;

pub use address::{split_host_port, AddressFamily, IpSubnet, NetAddress, ServiceFlags};
pub use hash::Hash;
pub use inv::{InvType, InvVect};
pub use message::{
    FilterType, Message, MiningStateMsg, RejectCode, RejectMsg, VersionMsg,
    MAX_BLOCKS_PER_MSG, MAX_BLOCK_HEADERS_PER_MSG, MAX_CF_HEADERS_PER_MSG, MAX_INV_PER_MSG,
    MAX_MS_BLOCKS_AT_HEAD_PER_MSG, MAX_MS_VOTES_AT_HEAD_PER_MSG,
};
pub use transaction::{Block, BlockHeader, OutPoint, Transaction, TxIn, TxKind, TxOut};

/// Initial protocol version that any peer must speak at minimum.
pub const INITIAL_PROTOCOL_VERSION: u32 = 1;

/// Protocol version at which the committed filter service was introduced.
/// A peer that negotiated this version or later knows whether the committed
/// filter service bit is advertised.
pub const NODE_CF_VERSION: u32 = 5;
