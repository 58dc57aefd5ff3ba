//! Mock subsystems and builders shared by the crate's tests.
#![allow(dead_code)]

use crate::config::ServerConfig;
use crate::error::SubsystemError;
use crate::server::{OutboundConn, Server};
use crate::session::PeerSession;
use crate::subsystems::{
    AddrManager, BestSnapshot, CfIndex, Chain, ConnManager, ConnReq, LocalAddressPriority,
    NatDevice, SyncManager, Subsystems, TimeSource, TxPool,
};
use crate::transport::{MessageDone, PeerCodec, PeerCodecConfig, PeerId, PeerTransport};
use aurum_wire::{
    split_host_port, Block, BlockHeader, FilterType, Hash, InvVect, Message, NetAddress,
    OutPoint, ServiceFlags, Transaction, TxIn, TxKind, TxOut,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch};

/// A hash whose first byte is `n`.
pub(crate) fn hash(n: u8) -> Hash {
    let mut bytes = [0u8; 32];
    bytes[0] = n;
    Hash(bytes)
}

/// A bare transaction of the given kind.
pub(crate) fn tx(hash: Hash, kind: TxKind) -> Transaction {
    Transaction {
        hash,
        kind,
        inputs: Vec::new(),
        outputs: Vec::new(),
        expiry: 0,
    }
}

/// A ticket purchase locking `value` at output zero with the given expiry.
pub(crate) fn ticket_tx(hash: Hash, value: i64, expiry: u32) -> Transaction {
    Transaction {
        hash,
        kind: TxKind::TicketPurchase,
        inputs: vec![TxIn {
            previous_outpoint: OutPoint {
                hash: Hash::default(),
                index: 0,
            },
        }],
        outputs: vec![TxOut { value }],
        expiry,
    }
}

/// A block with the given hash at the given height.
pub(crate) fn block(hash: Hash, height: u32) -> Block {
    Block {
        hash,
        header: BlockHeader {
            version: 1,
            prev_block: Hash::default(),
            merkle_root: Hash::default(),
            height,
            timestamp: SystemTime::now(),
        },
        transactions: Vec::new(),
    }
}

pub(crate) struct MockChain {
    best: Mutex<BestSnapshot>,
    blocks: Mutex<HashMap<Hash, Arc<Block>>>,
    locate_blocks_reply: Mutex<Vec<Hash>>,
    locate_headers_reply: Mutex<Vec<BlockHeader>>,
    next_stake_diff: Mutex<Result<i64, String>>,
    live_tickets: Mutex<HashSet<Hash>>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self {
            best: Mutex::new(BestSnapshot {
                hash: Hash::default(),
                height: 0,
            }),
            blocks: Mutex::new(HashMap::new()),
            locate_blocks_reply: Mutex::new(Vec::new()),
            locate_headers_reply: Mutex::new(Vec::new()),
            next_stake_diff: Mutex::new(Ok(0)),
            live_tickets: Mutex::new(HashSet::new()),
        }
    }
}

impl MockChain {
    pub fn set_best(&self, hash: Hash, height: i64) {
        *self.best.lock() = BestSnapshot { hash, height };
    }

    pub fn set_best_height(&self, height: i64) {
        self.best.lock().height = height;
    }

    pub fn add_block(&self, block: Block) {
        self.blocks.lock().insert(block.hash, Arc::new(block));
    }

    pub fn set_locate_blocks(&self, hashes: Vec<Hash>) {
        *self.locate_blocks_reply.lock() = hashes;
    }

    pub fn set_locate_headers(&self, headers: Vec<BlockHeader>) {
        *self.locate_headers_reply.lock() = headers;
    }

    pub fn set_next_stake_difficulty(&self, result: Result<i64, String>) {
        *self.next_stake_diff.lock() = result;
    }

    pub fn add_live_ticket(&self, ticket: Hash) {
        self.live_tickets.lock().insert(ticket);
    }
}

impl Chain for MockChain {
    fn best_snapshot(&self) -> BestSnapshot {
        self.best.lock().clone()
    }

    fn locate_blocks(&self, _locator: &[Hash], _hash_stop: &Hash, max_hashes: usize) -> Vec<Hash> {
        let mut reply = self.locate_blocks_reply.lock().clone();
        reply.truncate(max_hashes);
        reply
    }

    fn locate_headers(&self, _locator: &[Hash], _hash_stop: &Hash) -> Vec<BlockHeader> {
        self.locate_headers_reply.lock().clone()
    }

    fn block_by_hash(&self, hash: &Hash) -> Option<Arc<Block>> {
        self.blocks.lock().get(hash).cloned()
    }

    fn next_stake_difficulty(&self) -> Result<i64, SubsystemError> {
        self.next_stake_diff
            .lock()
            .clone()
            .map_err(SubsystemError)
    }

    fn check_live_ticket(&self, ticket: &Hash) -> bool {
        self.live_tickets.lock().contains(ticket)
    }
}

#[derive(Default)]
pub(crate) struct MockTxPool {
    txs: Mutex<HashMap<Hash, Arc<Transaction>>>,
    votes: Mutex<HashMap<Hash, Vec<Hash>>>,
}

impl MockTxPool {
    pub fn add_tx(&self, transaction: Transaction) {
        self.txs
            .lock()
            .insert(transaction.hash, Arc::new(transaction));
    }

    pub fn set_votes_for_block(&self, block: Hash, votes: Vec<Hash>) {
        self.votes.lock().insert(block, votes);
    }
}

impl TxPool for MockTxPool {
    fn tx_hashes(&self) -> Vec<Hash> {
        let mut hashes: Vec<Hash> = self.txs.lock().keys().copied().collect();
        hashes.sort();
        hashes
    }

    fn fetch_transaction(&self, hash: &Hash) -> Option<Arc<Transaction>> {
        self.txs.lock().get(hash).cloned()
    }

    fn vote_hashes_for_block(&self, block: &Hash) -> Vec<Hash> {
        self.votes.lock().get(block).cloned().unwrap_or_default()
    }
}

pub(crate) struct MockSyncManager {
    current: AtomicBool,
    auto_process: AtomicBool,
    new_peers: Mutex<Vec<PeerId>>,
    done_peers: Mutex<Vec<PeerId>>,
    queued_txs: Mutex<Vec<Hash>>,
    queued_blocks: Mutex<Vec<Hash>>,
    queued_invs: Mutex<Vec<Vec<InvVect>>>,
    queued_headers: Mutex<Vec<usize>>,
    tip_generation_reply: Mutex<Result<Vec<Hash>, String>>,
    requested: Mutex<Vec<(PeerId, Vec<Hash>, Vec<Hash>)>>,
}

impl MockSyncManager {
    pub fn new() -> Self {
        Self {
            current: AtomicBool::new(false),
            auto_process: AtomicBool::new(true),
            new_peers: Mutex::new(Vec::new()),
            done_peers: Mutex::new(Vec::new()),
            queued_txs: Mutex::new(Vec::new()),
            queued_blocks: Mutex::new(Vec::new()),
            queued_invs: Mutex::new(Vec::new()),
            queued_headers: Mutex::new(Vec::new()),
            tip_generation_reply: Mutex::new(Ok(Vec::new())),
            requested: Mutex::new(Vec::new()),
        }
    }

    pub fn set_current(&self, current: bool) {
        self.current.store(current, Ordering::SeqCst);
    }

    /// When disabled, `queue_tx`/`queue_block` no longer signal the session's
    /// processed channels automatically.
    pub fn set_auto_process(&self, auto: bool) {
        self.auto_process.store(auto, Ordering::SeqCst);
    }

    pub fn set_tip_generation(&self, reply: Result<Vec<Hash>, String>) {
        *self.tip_generation_reply.lock() = reply;
    }

    pub fn new_peer_ids(&self) -> Vec<PeerId> {
        self.new_peers.lock().clone()
    }

    pub fn done_peer_ids(&self) -> Vec<PeerId> {
        self.done_peers.lock().clone()
    }

    pub fn queued_tx_hashes(&self) -> Vec<Hash> {
        self.queued_txs.lock().clone()
    }

    pub fn queued_block_hashes(&self) -> Vec<Hash> {
        self.queued_blocks.lock().clone()
    }

    pub fn queued_inv_batches(&self) -> Vec<Vec<InvVect>> {
        self.queued_invs.lock().clone()
    }

    pub fn requested_from_peers(&self) -> Vec<(PeerId, Vec<Hash>, Vec<Hash>)> {
        self.requested.lock().clone()
    }
}

impl SyncManager for MockSyncManager {
    fn start(&self) {}
    fn stop(&self) {}

    fn is_current(&self) -> bool {
        self.current.load(Ordering::SeqCst)
    }

    fn new_peer(&self, peer: &Arc<PeerSession>) {
        self.new_peers.lock().push(peer.id());
    }

    fn done_peer(&self, peer: &Arc<PeerSession>) {
        self.done_peers.lock().push(peer.id());
    }

    fn queue_tx(&self, tx: Arc<Transaction>, peer: &Arc<PeerSession>) {
        self.queued_txs.lock().push(tx.hash());
        if self.auto_process.load(Ordering::SeqCst) {
            peer.mark_tx_processed();
        }
    }

    fn queue_block(&self, block: Arc<Block>, peer: &Arc<PeerSession>) {
        self.queued_blocks.lock().push(block.hash());
        if self.auto_process.load(Ordering::SeqCst) {
            peer.mark_block_processed();
        }
    }

    fn queue_inv(&self, inv: Vec<InvVect>, _peer: &Arc<PeerSession>) {
        self.queued_invs.lock().push(inv);
    }

    fn queue_headers(&self, headers: Vec<aurum_wire::BlockHeader>, _peer: &Arc<PeerSession>) {
        self.queued_headers.lock().push(headers.len());
    }

    fn tip_generation(&self) -> Result<Vec<Hash>, SubsystemError> {
        self.tip_generation_reply
            .lock()
            .clone()
            .map_err(SubsystemError)
    }

    fn sort_parents_by_votes(&self, _tip: &Hash, children: Vec<Hash>) -> Vec<Hash> {
        children
    }

    fn request_from_peer(
        &self,
        peer: &Arc<PeerSession>,
        blocks: &[Hash],
        votes: &[Hash],
    ) -> Result<(), SubsystemError> {
        self.requested
            .lock()
            .push((peer.id(), blocks.to_vec(), votes.to_vec()));
        Ok(())
    }
}

pub(crate) struct MockAddrManager {
    good_addrs: Mutex<Vec<String>>,
    connected_addrs: Mutex<Vec<String>>,
    attempted_addrs: Mutex<Vec<String>>,
    services_set: Mutex<Vec<(String, ServiceFlags)>>,
    added: Mutex<Vec<(Vec<NetAddress>, String)>>,
    cache: Mutex<Vec<NetAddress>>,
    need_more: AtomicBool,
    best_local: Mutex<Option<NetAddress>>,
    peer_na_valid: AtomicBool,
    locals: Mutex<Vec<(NetAddress, LocalAddressPriority)>>,
}

impl Default for MockAddrManager {
    fn default() -> Self {
        Self {
            good_addrs: Mutex::new(Vec::new()),
            connected_addrs: Mutex::new(Vec::new()),
            attempted_addrs: Mutex::new(Vec::new()),
            services_set: Mutex::new(Vec::new()),
            added: Mutex::new(Vec::new()),
            cache: Mutex::new(Vec::new()),
            need_more: AtomicBool::new(false),
            best_local: Mutex::new(None),
            peer_na_valid: AtomicBool::new(true),
            locals: Mutex::new(Vec::new()),
        }
    }
}

impl MockAddrManager {
    pub fn set_cache(&self, addrs: Vec<NetAddress>) {
        *self.cache.lock() = addrs;
    }

    pub fn set_need_more(&self, need_more: bool) {
        self.need_more.store(need_more, Ordering::SeqCst);
    }

    pub fn set_best_local(&self, addr: Option<NetAddress>) {
        *self.best_local.lock() = addr;
    }

    pub fn set_peer_na_valid(&self, valid: bool) {
        self.peer_na_valid.store(valid, Ordering::SeqCst);
    }

    pub fn good_addrs(&self) -> Vec<String> {
        self.good_addrs.lock().clone()
    }

    pub fn connected_addrs(&self) -> Vec<String> {
        self.connected_addrs.lock().clone()
    }

    pub fn attempted_addrs(&self) -> Vec<String> {
        self.attempted_addrs.lock().clone()
    }

    pub fn services_set_for(&self) -> Vec<(String, ServiceFlags)> {
        self.services_set.lock().clone()
    }

    pub fn added_batches(&self) -> Vec<(Vec<NetAddress>, String)> {
        self.added.lock().clone()
    }

    pub fn local_addresses(&self) -> Vec<(NetAddress, LocalAddressPriority)> {
        self.locals.lock().clone()
    }

    /// Local addresses registered at a specific priority.
    pub fn local_addresses_with_priority(
        &self,
        priority: LocalAddressPriority,
    ) -> Vec<NetAddress> {
        self.locals
            .lock()
            .iter()
            .filter(|(_, p)| *p == priority)
            .map(|(na, _)| na.clone())
            .collect()
    }
}

impl AddrManager for MockAddrManager {
    fn start(&self) {}
    fn stop(&self) {}

    fn good(&self, addr: &NetAddress) {
        self.good_addrs.lock().push(addr.key());
    }

    fn connected(&self, addr: &NetAddress) {
        self.connected_addrs.lock().push(addr.key());
    }

    fn attempt(&self, addr: &NetAddress) {
        self.attempted_addrs.lock().push(addr.key());
    }

    fn set_services(&self, addr: &NetAddress, services: ServiceFlags) {
        self.services_set.lock().push((addr.key(), services));
    }

    fn add_addresses(&self, addrs: Vec<NetAddress>, source: &NetAddress) {
        self.added.lock().push((addrs, source.key()));
    }

    fn address_cache(&self) -> Vec<NetAddress> {
        self.cache.lock().clone()
    }

    fn need_more_addresses(&self) -> bool {
        self.need_more.load(Ordering::SeqCst)
    }

    fn best_local_address(&self, _remote: &NetAddress) -> Option<NetAddress> {
        self.best_local.lock().clone()
    }

    fn is_routable(&self, addr: &NetAddress) -> bool {
        !addr.ip.is_loopback()
    }

    fn has_local_address(&self, addr: &NetAddress) -> bool {
        self.locals.lock().iter().any(|(na, _)| na.key() == addr.key())
    }

    fn add_local_address(
        &self,
        addr: NetAddress,
        priority: LocalAddressPriority,
    ) -> Result<(), SubsystemError> {
        self.locals.lock().push((addr, priority));
        Ok(())
    }

    fn host_to_net_address(
        &self,
        host: &str,
        port: u16,
        services: ServiceFlags,
    ) -> Result<NetAddress, SubsystemError> {
        let ip: IpAddr = host
            .parse()
            .map_err(|_| SubsystemError::new(format!("cannot resolve {host}")))?;
        Ok(NetAddress::new(ip, port, services))
    }

    fn is_peer_na_valid(&self, _peer_na: &NetAddress, _remote: &NetAddress) -> bool {
        self.peer_na_valid.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub(crate) struct MockCfIndex {
    filters: Mutex<HashMap<(Hash, FilterType), Vec<u8>>>,
    headers: Mutex<HashMap<(Hash, FilterType), Vec<u8>>>,
    built: Mutex<HashMap<(Hash, FilterType), Vec<u8>>>,
}

impl MockCfIndex {
    pub fn set_filter(&self, hash: Hash, filter_type: FilterType, bytes: Vec<u8>) {
        self.filters.lock().insert((hash, filter_type), bytes);
    }

    pub fn set_header(&self, hash: Hash, filter_type: FilterType, bytes: Vec<u8>) {
        self.headers.lock().insert((hash, filter_type), bytes);
    }

    pub fn set_built(&self, hash: Hash, filter_type: FilterType, bytes: Vec<u8>) {
        self.built.lock().insert((hash, filter_type), bytes);
    }
}

impl CfIndex for MockCfIndex {
    fn filter_by_block_hash(
        &self,
        hash: &Hash,
        filter_type: FilterType,
    ) -> Result<Vec<u8>, SubsystemError> {
        Ok(self
            .filters
            .lock()
            .get(&(*hash, filter_type))
            .cloned()
            .unwrap_or_default())
    }

    fn filter_header_by_block_hash(
        &self,
        hash: &Hash,
        filter_type: FilterType,
    ) -> Result<Vec<u8>, SubsystemError> {
        Ok(self
            .headers
            .lock()
            .get(&(*hash, filter_type))
            .cloned()
            .unwrap_or_default())
    }

    fn build_filter(
        &self,
        block: &Block,
        filter_type: FilterType,
    ) -> Result<Vec<u8>, SubsystemError> {
        self.built
            .lock()
            .get(&(block.hash, filter_type))
            .cloned()
            .ok_or_else(|| SubsystemError::new("no filter data"))
    }
}

#[derive(Default)]
pub(crate) struct MockConnManager {
    connects: Mutex<Vec<ConnReq>>,
    disconnects: Mutex<Vec<u64>>,
    removes: Mutex<Vec<u64>>,
}

impl MockConnManager {
    pub fn connect_requests(&self) -> Vec<ConnReq> {
        self.connects.lock().clone()
    }

    pub fn disconnect_ids(&self) -> Vec<u64> {
        self.disconnects.lock().clone()
    }

    pub fn removed_ids(&self) -> Vec<u64> {
        self.removes.lock().clone()
    }
}

impl ConnManager for MockConnManager {
    fn start(&self) {}
    fn stop(&self) {}

    fn connect(&self, req: ConnReq) {
        self.connects.lock().push(req);
    }

    fn disconnect(&self, id: u64) {
        self.disconnects.lock().push(id);
    }

    fn remove(&self, id: u64) {
        self.removes.lock().push(id);
    }
}

#[derive(Default)]
pub(crate) struct MockTimeSource {
    samples: Mutex<Vec<(String, SystemTime)>>,
}

impl MockTimeSource {
    pub fn samples(&self) -> Vec<(String, SystemTime)> {
        self.samples.lock().clone()
    }
}

impl TimeSource for MockTimeSource {
    fn add_time_sample(&self, source: &str, sample: SystemTime) {
        self.samples.lock().push((source.to_string(), sample));
    }
}

#[derive(Default)]
pub(crate) struct MockNat {
    pub mappings: Mutex<Vec<(u16, u16)>>,
    pub deleted: Mutex<Vec<(u16, u16)>>,
}

impl NatDevice for MockNat {
    fn add_port_mapping(
        &self,
        _protocol: &str,
        external_port: u16,
        internal_port: u16,
        _description: &str,
        _timeout_secs: u32,
    ) -> Result<u16, SubsystemError> {
        self.mappings.lock().push((external_port, internal_port));
        Ok(external_port)
    }

    fn delete_port_mapping(
        &self,
        _protocol: &str,
        external_port: u16,
        internal_port: u16,
    ) -> Result<(), SubsystemError> {
        self.deleted.lock().push((external_port, internal_port));
        Ok(())
    }

    fn external_address(&self) -> Result<IpAddr, SubsystemError> {
        Ok("198.51.100.200".parse().expect("valid address"))
    }
}

/// Codec stub; sessions in tests attach a [`MockTransport`] directly, and
/// TCP-level launches build one from the connection's remote address.
pub(crate) struct MockCodec {
    next_id: AtomicU32,
    launched: Mutex<Vec<String>>,
}

impl Default for MockCodec {
    fn default() -> Self {
        Self {
            next_id: AtomicU32::new(1000),
            launched: Mutex::new(Vec::new()),
        }
    }
}

impl MockCodec {
    /// Human-readable record of launched peers, e.g. `inbound 127.0.0.1:1`.
    pub fn launches(&self) -> Vec<String> {
        self.launched.lock().clone()
    }
}

impl PeerCodec for MockCodec {
    fn launch_inbound(
        &self,
        conn: tokio::net::TcpStream,
        _config: PeerCodecConfig,
        _session: Arc<PeerSession>,
    ) -> Arc<dyn PeerTransport> {
        let addr = conn
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "127.0.0.1:0".to_string());
        self.launched.lock().push(format!("inbound {addr}"));
        MockTransport::builder()
            .id(self.next_id.fetch_add(1, Ordering::SeqCst))
            .addr(addr)
            .inbound(true)
            .build()
    }

    fn launch_outbound(
        &self,
        _conn: tokio::net::TcpStream,
        addr: &str,
        _config: PeerCodecConfig,
        _session: Arc<PeerSession>,
    ) -> Result<Arc<dyn PeerTransport>, SubsystemError> {
        self.launched.lock().push(format!("outbound {addr}"));
        Ok(MockTransport::builder()
            .id(self.next_id.fetch_add(1, Ordering::SeqCst))
            .addr(addr.to_string())
            .inbound(false)
            .build())
    }
}

/// In-memory transport double.
///
/// Queued messages are recorded and "sent" by a drain task after a short
/// delay, firing completion channels the way the codec's write loop does.
/// `max_unsent` tracks the peak number of messages queued or in flight at
/// once.
pub(crate) struct MockTransport {
    id: PeerId,
    addr: String,
    net_address: NetAddress,
    inbound: bool,
    connected: watch::Sender<bool>,
    protocol_version: AtomicU32,
    services: Mutex<ServiceFlags>,
    version_known: AtomicBool,
    verack_received: AtomicBool,
    wants_headers: AtomicBool,
    known_inventory: Mutex<HashSet<InvVect>>,
    last_announced: Mutex<Option<Hash>>,
    last_height: AtomicI64,
    sent: Mutex<Vec<Message>>,
    inventory: Mutex<Vec<(InvVect, bool)>>,
    pushed_addrs: Mutex<Vec<Vec<NetAddress>>>,
    push_addr_error: Mutex<Option<String>>,
    drain_tx: mpsc::UnboundedSender<(Message, Option<MessageDone>)>,
    unsent: Arc<AtomicUsize>,
    max_unsent: Arc<AtomicUsize>,
}

pub(crate) struct MockTransportBuilder {
    id: u32,
    addr: String,
    inbound: bool,
    services: ServiceFlags,
    protocol_version: u32,
    wants_headers: bool,
    version_known: bool,
    verack_received: bool,
}

impl MockTransportBuilder {
    pub fn id(mut self, id: u32) -> Self {
        self.id = id;
        self
    }

    pub fn addr(mut self, addr: impl Into<String>) -> Self {
        self.addr = addr.into();
        self
    }

    pub fn inbound(mut self, inbound: bool) -> Self {
        self.inbound = inbound;
        self
    }

    pub fn services(mut self, services: ServiceFlags) -> Self {
        self.services = services;
        self
    }

    pub fn protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    pub fn wants_headers(mut self, wants: bool) -> Self {
        self.wants_headers = wants;
        self
    }

    pub fn version_known(mut self, known: bool) -> Self {
        self.version_known = known;
        self
    }

    pub fn verack_received(mut self, received: bool) -> Self {
        self.verack_received = received;
        self
    }

    pub fn build(self) -> Arc<MockTransport> {
        let (host, port) = split_host_port(&self.addr).expect("valid test address");
        let ip: IpAddr = host.parse().expect("valid test ip");
        let (connected, _) = watch::channel(true);
        let (drain_tx, mut drain_rx) = mpsc::unbounded_channel::<(Message, Option<MessageDone>)>();
        let unsent = Arc::new(AtomicUsize::new(0));
        let max_unsent = Arc::new(AtomicUsize::new(0));

        let transport = Arc::new(MockTransport {
            id: PeerId(self.id),
            addr: self.addr,
            net_address: NetAddress::new(ip, port, self.services),
            inbound: self.inbound,
            connected,
            protocol_version: AtomicU32::new(self.protocol_version),
            services: Mutex::new(self.services),
            version_known: AtomicBool::new(self.version_known),
            verack_received: AtomicBool::new(self.verack_received),
            wants_headers: AtomicBool::new(self.wants_headers),
            known_inventory: Mutex::new(HashSet::new()),
            last_announced: Mutex::new(None),
            last_height: AtomicI64::new(0),
            sent: Mutex::new(Vec::new()),
            inventory: Mutex::new(Vec::new()),
            pushed_addrs: Mutex::new(Vec::new()),
            push_addr_error: Mutex::new(None),
            drain_tx,
            unsent: unsent.clone(),
            max_unsent,
        });

        // Simulated write loop: one message in flight at a time.
        tokio::spawn(async move {
            while let Some((_msg, done)) = drain_rx.recv().await {
                tokio::time::sleep(Duration::from_micros(200)).await;
                unsent.fetch_sub(1, Ordering::SeqCst);
                if let Some(done) = done {
                    let _ = done.try_send(());
                }
            }
        });

        transport
    }
}

impl MockTransport {
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder {
            id: 1,
            addr: "10.0.0.1:9108".to_string(),
            inbound: false,
            services: ServiceFlags::NETWORK,
            protocol_version: aurum_wire::NODE_CF_VERSION,
            wants_headers: false,
            version_known: true,
            verack_received: true,
        }
    }

    pub fn sent_messages(&self) -> Vec<Message> {
        self.sent.lock().clone()
    }

    pub fn queued_inventory(&self) -> Vec<(InvVect, bool)> {
        self.inventory.lock().clone()
    }

    pub fn pushed_addr_batches(&self) -> Vec<Vec<NetAddress>> {
        self.pushed_addrs.lock().clone()
    }

    pub fn set_push_addr_error(&self, error: impl Into<String>) {
        *self.push_addr_error.lock() = Some(error.into());
    }

    pub fn set_last_announced_block(&self, hash: Option<Hash>) {
        *self.last_announced.lock() = hash;
    }

    pub fn set_version_known(&self, known: bool) {
        self.version_known.store(known, Ordering::SeqCst);
    }

    pub fn is_disconnected(&self) -> bool {
        !*self.connected.borrow()
    }

    pub fn max_unsent(&self) -> usize {
        self.max_unsent.load(Ordering::SeqCst)
    }
}

impl PeerTransport for MockTransport {
    fn id(&self) -> PeerId {
        self.id
    }

    fn addr(&self) -> String {
        self.addr.clone()
    }

    fn net_address(&self) -> NetAddress {
        self.net_address.clone()
    }

    fn inbound(&self) -> bool {
        self.inbound
    }

    fn connected(&self) -> bool {
        *self.connected.borrow()
    }

    fn connected_watch(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    fn disconnect(&self) {
        self.connected.send_replace(false);
    }

    fn protocol_version(&self) -> u32 {
        self.protocol_version.load(Ordering::SeqCst)
    }

    fn services(&self) -> ServiceFlags {
        *self.services.lock()
    }

    fn version_known(&self) -> bool {
        self.version_known.load(Ordering::SeqCst)
    }

    fn verack_received(&self) -> bool {
        self.verack_received.load(Ordering::SeqCst)
    }

    fn wants_headers(&self) -> bool {
        self.wants_headers.load(Ordering::SeqCst)
    }

    fn is_known_inventory(&self, inv: &InvVect) -> bool {
        self.known_inventory.lock().contains(inv)
    }

    fn add_known_inventory(&self, inv: &InvVect) {
        self.known_inventory.lock().insert(*inv);
    }

    fn last_announced_block(&self) -> Option<Hash> {
        *self.last_announced.lock()
    }

    fn clear_last_announced_block(&self) {
        *self.last_announced.lock() = None;
    }

    fn last_block_height(&self) -> i64 {
        self.last_height.load(Ordering::SeqCst)
    }

    fn update_last_block_height(&self, height: i64) {
        self.last_height.store(height, Ordering::SeqCst);
    }

    fn queue_message(&self, msg: Message, done: Option<MessageDone>) {
        self.sent.lock().push(msg.clone());
        let queued = self.unsent.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_unsent.fetch_max(queued, Ordering::SeqCst);
        let _ = self.drain_tx.send((msg, done));
    }

    fn queue_inventory(&self, inv: InvVect) {
        if !self.is_known_inventory(&inv) {
            self.inventory.lock().push((inv, false));
        }
    }

    fn queue_inventory_immediate(&self, inv: InvVect) {
        if !self.is_known_inventory(&inv) {
            self.inventory.lock().push((inv, true));
        }
    }

    fn push_addresses(&self, addrs: Vec<NetAddress>) -> Result<Vec<NetAddress>, SubsystemError> {
        if let Some(error) = self.push_addr_error.lock().clone() {
            return Err(SubsystemError(error));
        }
        self.pushed_addrs.lock().push(addrs.clone());
        Ok(addrs)
    }
}

/// Bundle of mocks behind a server.
pub(crate) struct Mocks {
    pub chain: Arc<MockChain>,
    pub tx_pool: Arc<MockTxPool>,
    pub sync_manager: Arc<MockSyncManager>,
    pub addr_manager: Arc<MockAddrManager>,
    pub cf_index: Arc<MockCfIndex>,
    pub conn_manager: Arc<MockConnManager>,
    pub time_source: Arc<MockTimeSource>,
    pub nat: Arc<MockNat>,
    pub codec: Arc<MockCodec>,
    pub outbound_tx: mpsc::Sender<OutboundConn>,
}

/// Configuration for a server that neither listens nor seeds.
pub(crate) fn test_config() -> ServerConfig {
    ServerConfig {
        disable_listen: true,
        disable_dns_seed: true,
        ..ServerConfig::default()
    }
}

pub(crate) async fn test_server_with_mocks() -> (Server, Mocks) {
    test_server_with_config(test_config()).await
}

pub(crate) async fn test_server_with_config(config: ServerConfig) -> (Server, Mocks) {
    let chain = Arc::new(MockChain::default());
    let tx_pool = Arc::new(MockTxPool::default());
    let sync_manager = Arc::new(MockSyncManager::new());
    let addr_manager = Arc::new(MockAddrManager::default());
    let cf_index = Arc::new(MockCfIndex::default());
    let conn_manager = Arc::new(MockConnManager::default());
    let time_source = Arc::new(MockTimeSource::default());
    let nat = Arc::new(MockNat::default());
    let codec = Arc::new(MockCodec::default());
    let (outbound_tx, outbound_rx) = mpsc::channel(8);

    let subsystems = Subsystems {
        chain: chain.clone(),
        tx_pool: tx_pool.clone(),
        sync_manager: sync_manager.clone(),
        addr_manager: addr_manager.clone(),
        cf_index: cf_index.clone(),
        conn_manager: conn_manager.clone(),
        time_source: time_source.clone(),
        codec: codec.clone(),
        nat: Some(nat.clone()),
    };

    let server = Server::new(config, subsystems, outbound_rx)
        .await
        .expect("test server");

    (
        server,
        Mocks {
            chain,
            tx_pool,
            sync_manager,
            addr_manager,
            cf_index,
            conn_manager,
            time_source,
            nat,
            codec,
            outbound_tx,
        },
    )
}

/// Poll until `condition` returns true or a short timeout elapses.
pub(crate) async fn wait_until<F>(mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
