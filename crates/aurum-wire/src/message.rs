//! The peer-to-peer message set and per-message size limits.

use crate::{Block, BlockHeader, Hash, InvVect, NetAddress, ServiceFlags, Transaction};
use std::fmt;
use std::time::SystemTime;

/// Maximum number of inventory vectors in a single inv, getdata, or notfound
/// message.
pub const MAX_INV_PER_MSG: usize = 50_000;

/// Maximum number of block hashes returned for a single getblocks request.
pub const MAX_BLOCKS_PER_MSG: usize = 500;

/// Maximum number of headers returned for a single getheaders request.
pub const MAX_BLOCK_HEADERS_PER_MSG: usize = 2_000;

/// Maximum number of committed filter headers per cfheaders message.
pub const MAX_CF_HEADERS_PER_MSG: usize = 2_000;

/// Maximum number of block hashes in a mining state message.
pub const MAX_MS_BLOCKS_AT_HEAD_PER_MSG: usize = 8;

/// Maximum number of vote hashes in a mining state message.
pub const MAX_MS_VOTES_AT_HEAD_PER_MSG: usize = 40;

/// Committed filter type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterType {
    /// Filter over regular transaction data.
    Regular,
    /// Filter over extended (stake) transaction data.
    Extended,
}

/// Payload of a version message.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionMsg {
    pub protocol_version: u32,
    pub services: ServiceFlags,
    pub timestamp: SystemTime,
    /// The address of the receiving node as seen by the remote peer.
    pub addr_you: NetAddress,
    pub user_agent: String,
    /// Height of the remote peer's best block.
    pub last_block: i64,
    /// Whether the remote peer wants transaction relay suppressed.
    pub disable_relay_tx: bool,
}

/// Reject reason codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    Nonstandard,
}

impl fmt::Display for RejectCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectCode::Malformed => write!(f, "malformed"),
            RejectCode::Invalid => write!(f, "invalid"),
            RejectCode::Obsolete => write!(f, "obsolete"),
            RejectCode::Duplicate => write!(f, "duplicate"),
            RejectCode::Nonstandard => write!(f, "nonstandard"),
        }
    }
}

/// Payload of a reject message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectMsg {
    /// Command of the message being rejected.
    pub command: &'static str,
    pub code: RejectCode,
    pub reason: String,
}

/// Payload of a mining state message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MiningStateMsg {
    pub height: u32,
    pub block_hashes: Vec<Hash>,
    pub vote_hashes: Vec<Hash>,
}

/// A wire protocol message.
///
/// The framed codec owns encoding and decoding; the server only constructs
/// and consumes these in-memory values.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Version(VersionMsg),
    Verack,
    Addr(Vec<NetAddress>),
    GetAddr,
    Inv(Vec<InvVect>),
    GetData(Vec<InvVect>),
    NotFound(Vec<InvVect>),
    GetBlocks {
        locator: Vec<Hash>,
        hash_stop: Hash,
    },
    GetHeaders {
        locator: Vec<Hash>,
        hash_stop: Hash,
    },
    Headers(Vec<BlockHeader>),
    Block(Block),
    Tx(Transaction),
    MemPool,
    GetMiningState,
    MiningState(MiningStateMsg),
    GetCFilter {
        block_hash: Hash,
        filter_type: FilterType,
    },
    CFilter {
        block_hash: Hash,
        filter_type: FilterType,
        data: Vec<u8>,
    },
    GetCFHeaders {
        locator: Vec<Hash>,
        hash_stop: Hash,
        filter_type: FilterType,
    },
    CFHeaders {
        stop_hash: Hash,
        filter_type: FilterType,
        headers: Vec<Hash>,
    },
    GetCFTypes,
    CFTypes(Vec<FilterType>),
    Reject(RejectMsg),
}

impl Message {
    /// The protocol command name, used in logs and reject messages.
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => "version",
            Message::Verack => "verack",
            Message::Addr(_) => "addr",
            Message::GetAddr => "getaddr",
            Message::Inv(_) => "inv",
            Message::GetData(_) => "getdata",
            Message::NotFound(_) => "notfound",
            Message::GetBlocks { .. } => "getblocks",
            Message::GetHeaders { .. } => "getheaders",
            Message::Headers(_) => "headers",
            Message::Block(_) => "block",
            Message::Tx(_) => "tx",
            Message::MemPool => "mempool",
            Message::GetMiningState => "getminingstate",
            Message::MiningState(_) => "miningstate",
            Message::GetCFilter { .. } => "getcfilter",
            Message::CFilter { .. } => "cfilter",
            Message::GetCFHeaders { .. } => "getcfheaders",
            Message::CFHeaders { .. } => "cfheaders",
            Message::GetCFTypes => "getcftypes",
            Message::CFTypes(_) => "cftypes",
            Message::Reject(_) => "reject",
        }
    }
}
