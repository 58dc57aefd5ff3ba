//! Interfaces to the external collaborators of the server.
//!
//! The server never owns consensus, mempool, or address-book state. Each
//! collaborator is specified by the operations the server calls on it, and
//! sessions are handed capability objects rather than concrete types so no
//! dependency cycle forms between the server and its subsystems.

use crate::error::SubsystemError;
use crate::session::PeerSession;
use aurum_wire::{
    Block, BlockHeader, FilterType, Hash, InvVect, NetAddress, ServiceFlags, Transaction,
};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::SystemTime;

/// Snapshot of the chain tip.
#[derive(Debug, Clone)]
pub struct BestSnapshot {
    pub hash: Hash,
    pub height: i64,
}

/// Handle to a connection request tracked by the connection manager.
///
/// The manager assigns the id when the request is accepted; persistent
/// requests are redialed by the manager until removed.
#[derive(Debug, Clone)]
pub struct ConnReq {
    pub id: u64,
    pub addr: String,
    pub permanent: bool,
}

/// Block chain read operations used by the request handlers and the
/// rebroadcast pruner.
pub trait Chain: Send + Sync {
    /// Current best block.
    fn best_snapshot(&self) -> BestSnapshot;

    /// Block hashes on the main chain after the most recent locator match,
    /// up to `max_hashes` or the stop hash.
    fn locate_blocks(&self, locator: &[Hash], hash_stop: &Hash, max_hashes: usize) -> Vec<Hash>;

    /// Headers on the main chain after the most recent locator match.
    fn locate_headers(&self, locator: &[Hash], hash_stop: &Hash) -> Vec<BlockHeader>;

    /// Fetch a block by hash, including side-chain blocks.
    fn block_by_hash(&self, hash: &Hash) -> Option<Arc<Block>>;

    /// The stake difficulty required of the next block's tickets.
    fn next_stake_difficulty(&self) -> Result<i64, SubsystemError>;

    /// Whether the given ticket is still live (bought, matured, not yet
    /// voted, missed, or revoked).
    fn check_live_ticket(&self, ticket: &Hash) -> bool;
}

/// Transaction memory pool read operations.
pub trait TxPool: Send + Sync {
    /// Hashes of all transactions currently in the pool.
    fn tx_hashes(&self) -> Vec<Hash>;

    /// Fetch a pool transaction by hash.
    fn fetch_transaction(&self, hash: &Hash) -> Option<Arc<Transaction>>;

    /// Hashes of the votes in the pool that vote on the given block.
    fn vote_hashes_for_block(&self, block: &Hash) -> Vec<Hash>;
}

/// The chain synchronization manager. It drives initial block download and
/// is the consumer of inbound tx/block/inv/headers traffic.
pub trait SyncManager: Send + Sync {
    fn start(&self);
    fn stop(&self);

    /// Whether the manager believes the chain is synced to the network tip.
    fn is_current(&self) -> bool;

    /// A new peer has completed version negotiation and is a sync candidate.
    fn new_peer(&self, peer: &Arc<PeerSession>);

    /// A peer has disconnected.
    fn done_peer(&self, peer: &Arc<PeerSession>);

    /// Process a transaction received from a peer. The manager must signal
    /// [`PeerSession::mark_tx_processed`] exactly once when finished.
    fn queue_tx(&self, tx: Arc<Transaction>, peer: &Arc<PeerSession>);

    /// Process a block received from a peer. The manager must signal
    /// [`PeerSession::mark_block_processed`] exactly once when finished.
    fn queue_block(&self, block: Arc<Block>, peer: &Arc<PeerSession>);

    /// Examine inventory advertised by a peer.
    fn queue_inv(&self, inv: Vec<InvVect>, peer: &Arc<PeerSession>);

    /// Process headers received from a peer.
    fn queue_headers(&self, headers: Vec<BlockHeader>, peer: &Arc<PeerSession>);

    /// The generation of blocks stemming from the parent of the current tip.
    fn tip_generation(&self) -> Result<Vec<Hash>, SubsystemError>;

    /// Order sibling tip blocks by how many votes each has in the mempool,
    /// best first.
    fn sort_parents_by_votes(&self, tip: &Hash, children: Vec<Hash>) -> Vec<Hash>;

    /// Request the given blocks and votes from a peer.
    fn request_from_peer(
        &self,
        peer: &Arc<PeerSession>,
        blocks: &[Hash],
        votes: &[Hash],
    ) -> Result<(), SubsystemError>;
}

/// Priority of a local address registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LocalAddressPriority {
    Interface,
    Bound,
    Upnp,
    Manual,
}

/// The peer address book.
pub trait AddrManager: Send + Sync {
    fn start(&self);
    fn stop(&self);

    /// Mark an address as known good (version negotiation completed).
    fn good(&self, addr: &NetAddress);

    /// Mark an address as connected-to for last-seen bookkeeping.
    fn connected(&self, addr: &NetAddress);

    /// Mark an address as attempted.
    fn attempt(&self, addr: &NetAddress);

    /// Record the services advertised by an address.
    fn set_services(&self, addr: &NetAddress, services: ServiceFlags);

    /// Add addresses learned from the given source peer.
    fn add_addresses(&self, addrs: Vec<NetAddress>, source: &NetAddress);

    /// A cached subset of known addresses suitable for a getaddr reply.
    fn address_cache(&self) -> Vec<NetAddress>;

    /// Whether the manager wants more addresses.
    fn need_more_addresses(&self) -> bool;

    /// The local address that best matches the given remote peer.
    fn best_local_address(&self, remote: &NetAddress) -> Option<NetAddress>;

    /// Whether an address is publicly routable.
    fn is_routable(&self, addr: &NetAddress) -> bool;

    /// Whether the address is already registered as a local address.
    fn has_local_address(&self, addr: &NetAddress) -> bool;

    /// Register a local address at the given priority.
    fn add_local_address(
        &self,
        addr: NetAddress,
        priority: LocalAddressPriority,
    ) -> Result<(), SubsystemError>;

    /// Resolve a host name or IP string into a network address.
    fn host_to_net_address(
        &self,
        host: &str,
        port: u16,
        services: ServiceFlags,
    ) -> Result<NetAddress, SubsystemError>;

    /// Whether a peer-reported "your address" hint is plausible coming from
    /// the given remote peer.
    fn is_peer_na_valid(&self, peer_na: &NetAddress, remote: &NetAddress) -> bool;
}

/// The GCS committed filter index.
pub trait CfIndex: Send + Sync {
    /// Precomputed filter bytes for a main chain block. An empty vector
    /// means the filter is not indexed (side chain or disconnected block).
    fn filter_by_block_hash(
        &self,
        hash: &Hash,
        filter_type: FilterType,
    ) -> Result<Vec<u8>, SubsystemError>;

    /// Committed filter header bytes for a block.
    fn filter_header_by_block_hash(
        &self,
        hash: &Hash,
        filter_type: FilterType,
    ) -> Result<Vec<u8>, SubsystemError>;

    /// Build the filter for a block on the fly, used when the index has no
    /// entry for it.
    fn build_filter(&self, block: &Block, filter_type: FilterType)
        -> Result<Vec<u8>, SubsystemError>;
}

/// The connection manager: dial scheduling, retries, and persistent
/// reconnects. Established outbound connections are delivered to the server
/// over the channel supplied at construction time.
pub trait ConnManager: Send + Sync {
    fn start(&self);
    fn stop(&self);

    /// Request a new outbound connection.
    fn connect(&self, req: ConnReq);

    /// Note a disconnect for the given request so retry scheduling sees it.
    fn disconnect(&self, id: u64);

    /// Remove a request entirely, canceling any pending reconnect.
    fn remove(&self, id: u64);
}

/// A NAT traversal device discovered via UPnP.
pub trait NatDevice: Send + Sync {
    /// Map an external port to the local listen port. Returns the external
    /// port actually mapped.
    fn add_port_mapping(
        &self,
        protocol: &str,
        external_port: u16,
        internal_port: u16,
        description: &str,
        timeout_secs: u32,
    ) -> Result<u16, SubsystemError>;

    /// Remove a previously added mapping.
    fn delete_port_mapping(
        &self,
        protocol: &str,
        external_port: u16,
        internal_port: u16,
    ) -> Result<(), SubsystemError>;

    /// The external address of the gateway.
    fn external_address(&self) -> Result<IpAddr, SubsystemError>;
}

/// Median network time tracker.
pub trait TimeSource: Send + Sync {
    /// Add a time sample from the given peer.
    fn add_time_sample(&self, source: &str, sample: SystemTime);
}

/// The full set of collaborators handed to the server at construction.
#[derive(Clone)]
pub struct Subsystems {
    pub chain: Arc<dyn Chain>,
    pub tx_pool: Arc<dyn TxPool>,
    pub sync_manager: Arc<dyn SyncManager>,
    pub addr_manager: Arc<dyn AddrManager>,
    pub cf_index: Arc<dyn CfIndex>,
    pub conn_manager: Arc<dyn ConnManager>,
    pub time_source: Arc<dyn TimeSource>,
    pub codec: Arc<dyn crate::transport::PeerCodec>,
    pub nat: Option<Arc<dyn NatDevice>>,
}
