//! Per-peer session state and wire-message handlers.
//!
//! A [`PeerSession`] wraps one framed codec connection. The codec dispatches
//! inbound wire messages to the `on_*` callbacks here; state-changing effects
//! either hit lock-guarded per-peer fields or are posted to the server's
//! event loop over its channels.

use crate::ban_score::DynamicBanScore;
use crate::error::SubsystemError;
use crate::known_addrs::KnownAddressCache;
use crate::server::Server;
use crate::subsystems::ConnReq;
use crate::transport::{MessageDone, PeerId, PeerTransport};
use crate::MAX_KNOWN_ADDRS_PER_PEER;
use aurum_wire::{
    FilterType, Hash, InvType, InvVect, Message, MiningStateMsg, NetAddress, RejectCode,
    RejectMsg, ServiceFlags, Transaction, VersionMsg, INITIAL_PROTOCOL_VERSION,
    MAX_BLOCKS_PER_MSG, MAX_CF_HEADERS_PER_MSG, MAX_INV_PER_MSG, MAX_MS_VOTES_AT_HEAD_PER_MSG,
    NODE_CF_VERSION,
};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, trace, warn};

/// State shared between the server and one peer connection.
pub struct PeerSession {
    server: Server,
    transport: OnceCell<Arc<dyn PeerTransport>>,
    persistent: bool,
    whitelisted: bool,
    conn_req: Mutex<Option<ConnReq>>,

    /// Last block of a maxed-out getblocks reply; serving it later triggers
    /// a fresh tip announcement.
    continue_hash: Mutex<Option<Hash>>,

    /// Whether the peer asked for transaction relay to be suppressed. Read
    /// from the relay fan-out, so it carries its own lock.
    disable_relay_tx: Mutex<bool>,

    /// The "your address" value from the peer's version message. Read from
    /// the local-address discovery path, so it carries its own lock.
    peer_na: Mutex<Option<NetAddress>>,

    /// Transactions the sync manager has requested from this peer.
    requested_txns: Mutex<HashSet<Hash>>,
    /// Blocks the sync manager has requested from this peer.
    requested_blocks: Mutex<HashSet<Hash>>,

    known_addresses: Mutex<KnownAddressCache>,
    ban_score: DynamicBanScore,

    addrs_sent: AtomicBool,
    get_mining_state_sent: AtomicBool,

    /// Rendezvous signals from the sync manager; the receive path blocks on
    /// these so a peer can have at most one tx/block in flight.
    tx_processed: Notify,
    block_processed: Notify,

    /// Flips to true when the peer's done handler has run.
    quit: watch::Sender<bool>,
}

impl PeerSession {
    /// Create a session for a connection that is about to be associated with
    /// a codec transport via [`PeerSession::attach_transport`].
    pub fn new(server: Server, persistent: bool, whitelisted: bool) -> Arc<Self> {
        let (quit, _) = watch::channel(false);
        Arc::new(Self {
            server,
            transport: OnceCell::new(),
            persistent,
            whitelisted,
            conn_req: Mutex::new(None),
            continue_hash: Mutex::new(None),
            disable_relay_tx: Mutex::new(false),
            peer_na: Mutex::new(None),
            requested_txns: Mutex::new(HashSet::new()),
            requested_blocks: Mutex::new(HashSet::new()),
            known_addresses: Mutex::new(KnownAddressCache::new(MAX_KNOWN_ADDRS_PER_PEER)),
            ban_score: DynamicBanScore::new(),
            addrs_sent: AtomicBool::new(false),
            get_mining_state_sent: AtomicBool::new(false),
            tx_processed: Notify::new(),
            block_processed: Notify::new(),
            quit,
        })
    }

    /// Associate the codec transport. Must happen before any callback runs.
    pub fn attach_transport(&self, transport: Arc<dyn PeerTransport>) {
        if self.transport.set(transport).is_err() {
            warn!("transport already attached to session");
        }
    }

    /// The codec transport for this peer.
    pub fn transport(&self) -> &Arc<dyn PeerTransport> {
        self.transport
            .get()
            .expect("transport attached before first use")
    }

    /// Codec-assigned peer id.
    pub fn id(&self) -> PeerId {
        self.transport().id()
    }

    /// Remote address in `host:port` form.
    pub fn addr(&self) -> String {
        self.transport().addr()
    }

    /// Whether the connection was accepted rather than dialed.
    pub fn inbound(&self) -> bool {
        self.transport().inbound()
    }

    /// Whether the peer was dialed as a persistent peer.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    /// Whether the peer matched a whitelisted subnet.
    pub fn is_whitelisted(&self) -> bool {
        self.whitelisted
    }

    /// The connection request this peer was dialed from, if any.
    pub fn conn_req(&self) -> Option<ConnReq> {
        self.conn_req.lock().clone()
    }

    /// Record the connection request handle for an outbound peer.
    pub fn set_conn_req(&self, req: ConnReq) {
        *self.conn_req.lock() = Some(req);
    }

    /// Clear the connection request so the connection manager does not
    /// schedule a reconnect, returning the old handle.
    pub fn take_conn_req(&self) -> Option<ConnReq> {
        self.conn_req.lock().take()
    }

    /// The peer-reported "your address" hint from its version message.
    pub fn peer_na(&self) -> Option<NetAddress> {
        self.peer_na.lock().clone()
    }

    /// Toggle transaction relay for this peer. Safe for concurrent access.
    pub fn set_disable_relay_tx(&self, disable: bool) {
        *self.disable_relay_tx.lock() = disable;
    }

    /// Whether transaction relay is disabled. Safe for concurrent access.
    pub fn relay_tx_disabled(&self) -> bool {
        *self.disable_relay_tx.lock()
    }

    /// The peer's decaying misbehavior score.
    pub fn ban_score(&self) -> &DynamicBanScore {
        &self.ban_score
    }

    /// Record a transaction requested from this peer.
    pub fn add_requested_tx(&self, hash: Hash) {
        self.requested_txns.lock().insert(hash);
    }

    /// Whether a transaction is outstanding against this peer.
    pub fn is_requested_tx(&self, hash: &Hash) -> bool {
        self.requested_txns.lock().contains(hash)
    }

    /// Drop a transaction request, typically once processed.
    pub fn remove_requested_tx(&self, hash: &Hash) {
        self.requested_txns.lock().remove(hash);
    }

    /// Record a block requested from this peer.
    pub fn add_requested_block(&self, hash: Hash) {
        self.requested_blocks.lock().insert(hash);
    }

    /// Whether a block is outstanding against this peer.
    pub fn is_requested_block(&self, hash: &Hash) -> bool {
        self.requested_blocks.lock().contains(hash)
    }

    /// Drop a block request.
    pub fn remove_requested_block(&self, hash: &Hash) {
        self.requested_blocks.lock().remove(hash);
    }

    /// Signal that the sync manager finished processing a transaction from
    /// this peer, releasing the receive path.
    pub fn mark_tx_processed(&self) {
        self.tx_processed.notify_one();
    }

    /// Signal that the sync manager finished processing a block from this
    /// peer, releasing the receive path.
    pub fn mark_block_processed(&self) {
        self.block_processed.notify_one();
    }

    /// Mark the session as fully torn down.
    pub(crate) fn mark_quit(&self) {
        self.quit.send_replace(true);
    }

    /// Watch that flips to true once the session is torn down.
    pub fn quit_signal(&self) -> watch::Receiver<bool> {
        self.quit.subscribe()
    }

    fn add_known_addresses(&self, addresses: &[NetAddress]) {
        let mut cache = self.known_addresses.lock();
        for na in addresses {
            cache.insert(na.key());
        }
    }

    fn address_known(&self, na: &NetAddress) -> bool {
        self.known_addresses.lock().contains(&na.key())
    }

    #[cfg(test)]
    pub(crate) fn known_address_count(&self) -> usize {
        self.known_addresses.lock().len()
    }

    /// Send an addr message with the given addresses, skipping those the
    /// peer already knows about.
    pub fn push_addr_msg(&self, addresses: Vec<NetAddress>) {
        let addrs: Vec<NetAddress> = addresses
            .into_iter()
            .filter(|na| !self.address_known(na))
            .collect();
        match self.transport().push_addresses(addrs) {
            Ok(sent) => self.add_known_addresses(&sent),
            Err(e) => {
                error!(peer = %self, error = %e, "can't push address message");
                self.transport().disconnect();
            }
        }
    }

    /// Apply the misbehavior scoring policy.
    ///
    /// Increases the persistent and decaying score components by the given
    /// amounts. Crossing half the ban threshold logs a warning with the
    /// reason; crossing the threshold itself enqueues the peer for a ban and
    /// disconnects it.
    pub async fn add_ban_score(self: &Arc<Self>, persistent: u32, transient: u32, reason: &str) {
        let config = self.server.config();
        if config.disable_banning {
            return;
        }
        if self.whitelisted {
            debug!(peer = %self, reason, "misbehaving whitelisted peer");
            return;
        }

        let warn_threshold = config.ban_threshold >> 1;
        if persistent == 0 && transient == 0 {
            // The score is not being increased, but a warning is still
            // logged when it already sits above the warn threshold.
            let score = self.ban_score.current();
            if score > warn_threshold {
                warn!(
                    peer = %self,
                    reason,
                    score,
                    "misbehaving peer; score was not increased this time"
                );
            }
            return;
        }

        let score = self.ban_score.increase(persistent, transient);
        if score > warn_threshold {
            warn!(peer = %self, reason, score, "misbehaving peer; ban score increased");
            if score > config.ban_threshold {
                warn!(peer = %self, "misbehaving peer; banning and disconnecting");
                self.server.ban_peer(self.clone()).await;
                self.transport().disconnect();
            }
        }
    }

    /// Version negotiation hook. Returning a reject causes the codec to send
    /// it and drop the connection.
    pub async fn on_version(self: &Arc<Self>, msg: &VersionMsg) -> Option<RejectMsg> {
        let config = self.server.config();
        let subsystems = self.server.subsystems();
        let transport = self.transport();
        let inbound = transport.inbound();
        let remote = transport.net_address();

        // Record the advertised services for outbound connections even when
        // the peer ends up rejected below, so the address manager stays
        // accurate if a newer minimum version is ever enforced. Inbound
        // peers are skipped to limit malicious influence, and the simulation
        // network never updates the address book.
        if !config.simnet() && !inbound {
            subsystems.addr_manager.set_services(&remote, msg.services);
        }

        // Peers that are too old are dropped by the codec once this callback
        // returns without a reject.
        if msg.protocol_version < INITIAL_PROTOCOL_VERSION {
            return None;
        }

        // Outbound peers must be full nodes.
        let want_services = crate::DEFAULT_REQUIRED_SERVICES;
        if !inbound && !msg.services.has(want_services) {
            let missing = msg.services.missing(want_services);
            debug!(
                peer = %self,
                services = %msg.services,
                missing = %missing,
                "rejecting peer for not providing desired services"
            );
            let reason = format!("required services {:#x} not offered", missing.0);
            return Some(RejectMsg {
                command: "version",
                code: RejectCode::Nonstandard,
                reason,
            });
        }

        if !config.simnet() && !inbound {
            // Advertise our best-matching local address when the server
            // accepts connections and believes it is close to the network
            // tip.
            if !config.disable_listen && subsystems.sync_manager.is_current() {
                if let Some(local) = subsystems.addr_manager.best_local_address(&remote) {
                    if subsystems.addr_manager.is_routable(&local) {
                        self.push_addr_msg(vec![local]);
                    }
                }
            }

            // Request known addresses when the address manager runs low.
            if subsystems.addr_manager.need_more_addresses() {
                transport.queue_message(Message::GetAddr, None);
            }

            subsystems.addr_manager.good(&remote);
        }

        if !inbound {
            *self.peer_na.lock() = Some(msg.addr_you.clone());
        }

        self.set_disable_relay_tx(msg.disable_relay_tx);

        // Feed the remote clock into the median time source.
        subsystems
            .time_source
            .add_time_sample(&transport.addr(), msg.timestamp);

        // The peer is now a sync candidate.
        subsystems.sync_manager.new_peer(self);

        self.server.add_peer(self.clone()).await;
        None
    }

    /// Reply to a mempool request with the pool contents as inventory.
    pub async fn on_mempool(self: &Arc<Self>) {
        // A decaying score increase makes bursts of mempool requests cross
        // the ban threshold while occasional ones decay away.
        self.add_ban_score(0, 33, "mempool").await;

        let tx_hashes = self.server.subsystems().tx_pool.tx_hashes();
        let mut inv = Vec::with_capacity(tx_hashes.len().min(MAX_INV_PER_MSG));
        for (i, hash) in tx_hashes.into_iter().enumerate() {
            inv.push(InvVect::tx(hash));
            if i + 1 >= MAX_INV_PER_MSG {
                break;
            }
        }

        if !inv.is_empty() {
            self.transport().queue_message(Message::Inv(inv), None);
        }
    }

    /// Hand a received transaction to the sync manager and block the receive
    /// path until it has been fully processed.
    pub async fn on_tx(self: &Arc<Self>, tx: Transaction) {
        if self.server.config().blocks_only {
            trace!(tx = %tx.hash(), peer = %self, "ignoring tx, blocksonly enabled");
            return;
        }

        let tx = Arc::new(tx);
        let iv = InvVect::tx(tx.hash());
        self.transport().add_known_inventory(&iv);

        // Block further receives until the transaction is known good or bad
        // so a malicious peer cannot queue up unbounded bad transactions
        // before it can be disconnected.
        self.server.subsystems().sync_manager.queue_tx(tx, self);
        self.wait_processed(&self.tx_processed).await;
    }

    /// Hand a received block to the sync manager and block the receive path
    /// until it has been fully processed.
    pub async fn on_block(self: &Arc<Self>, block: aurum_wire::Block) {
        let block = Arc::new(block);
        let iv = InvVect::block(block.hash());
        self.transport().add_known_inventory(&iv);

        // Serializing here bounds per-peer memory and matches the sync
        // manager's one-block-at-a-time processing.
        self.server.subsystems().sync_manager.queue_block(block, self);
        self.wait_processed(&self.block_processed).await;
    }

    async fn wait_processed(&self, processed: &Notify) {
        let mut quit = self.quit.subscribe();
        tokio::select! {
            _ = processed.notified() => {}
            _ = quit.wait_for(|quit| *quit) => {}
        }
    }

    /// Examine advertised inventory. In blocks-only mode a transaction
    /// announcement disconnects the peer.
    pub async fn on_inv(self: &Arc<Self>, inv: Vec<InvVect>) {
        let subsystems = self.server.subsystems();
        if !self.server.config().blocks_only {
            if !inv.is_empty() {
                subsystems.sync_manager.queue_inv(inv, self);
            }
            return;
        }

        let mut filtered = Vec::with_capacity(inv.len());
        for iv in inv {
            if iv.inv_type == InvType::Tx {
                info!(peer = %self, "peer is announcing transactions, disconnecting");
                self.transport().disconnect();
                return;
            }
            filtered.push(iv);
        }
        if !filtered.is_empty() {
            subsystems.sync_manager.queue_inv(filtered, self);
        }
    }

    /// Forward received headers to the sync manager.
    pub async fn on_headers(self: &Arc<Self>, headers: Vec<aurum_wire::BlockHeader>) {
        self.server
            .subsystems()
            .sync_manager
            .queue_headers(headers, self);
    }

    /// Serve a getdata request.
    ///
    /// Payloads are streamed with at most two unsent messages queued behind
    /// the one on the wire: every third send carries a completion channel
    /// and the following send waits on it after its own fetch, overlapping
    /// the database read with the network write. The callback only returns
    /// once the final payload is on the wire so the peer's liveness timer
    /// cannot fire mid-delivery.
    pub async fn on_get_data(self: &Arc<Self>, inv_list: Vec<InvVect>) {
        if inv_list.is_empty() {
            return;
        }

        let length = inv_list.len();
        // Unusually large queries accrue score; a single maximum-size
        // request stays below the ban threshold but sustained bursts do
        // not. Small requests are free so peers doing initial sync are not
        // penalized.
        let transient = (length * 99 / MAX_INV_PER_MSG) as u32;
        self.add_ban_score(0, transient, "getdata").await;

        let mut num_added = 0usize;
        let mut done_used = false;
        let mut not_found: Vec<InvVect> = Vec::new();
        let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
        let mut wait_rx: Option<mpsc::Receiver<()>> = None;

        for (i, iv) in inv_list.iter().enumerate() {
            let last = i == length - 1;
            let (c_tx, mut c_rx) = if last && not_found.is_empty() {
                done_used = true;
                (Some(done_tx.clone()), None)
            } else if (i + 1) % 3 == 0 {
                let (tx, rx) = mpsc::channel::<()>(1);
                (Some(tx), Some(rx))
            } else {
                (None, None)
            };

            let result = match iv.inv_type {
                InvType::Tx => self.push_tx_msg(&iv.hash, c_tx.clone(), wait_rx.take()).await,
                InvType::Block => {
                    self.push_block_msg(&iv.hash, c_tx.clone(), wait_rx.take())
                        .await
                }
                InvType::FilteredBlock => {
                    warn!(inv_type = %iv.inv_type, "unknown type in inventory request");
                    continue;
                }
            };

            if result.is_err() {
                not_found.push(*iv);

                // When the final entry misses and a completion channel was
                // allocated for it, consume the miss signal now: the done
                // channel is about to be reused for the not-found reply.
                if last && c_tx.is_some() {
                    if let Some(mut rx) = c_rx.take() {
                        let _ = rx.recv().await;
                    } else {
                        let _ = done_rx.recv().await;
                        done_used = false;
                    }
                }
            }
            num_added += 1;
            wait_rx = c_rx;
        }

        if !not_found.is_empty() {
            done_used = true;
            self.transport()
                .queue_message(Message::NotFound(not_found), Some(done_tx.clone()));
        }
        drop(done_tx);

        // Hold the receive path until everything is sent. A lot of data can
        // be outstanding at this point and processing further messages from
        // the peer before it drains would skew its liveness accounting.
        if num_added > 0 && done_used {
            let _ = done_rx.recv().await;
        }
    }

    /// Send a pool transaction to the peer, honoring the pipelining
    /// channels. An error means the transaction is not in the pool.
    async fn push_tx_msg(
        &self,
        hash: &Hash,
        done: Option<MessageDone>,
        wait: Option<mpsc::Receiver<()>>,
    ) -> Result<(), SubsystemError> {
        // Transactions that left the pool for a block are intentionally not
        // served, even when still unconfirmed from the peer's view.
        let Some(tx) = self.server.subsystems().tx_pool.fetch_transaction(hash) else {
            trace!(tx = %hash, "unable to fetch tx from transaction pool");
            if let Some(done) = done {
                let _ = done.try_send(());
            }
            return Err(SubsystemError::new("transaction not in pool"));
        };

        // The fetch happened above; only now wait for the previous send so
        // the database read overlaps the wire write.
        if let Some(mut wait) = wait {
            let _ = wait.recv().await;
        }

        self.transport()
            .queue_message(Message::Tx((*tx).clone()), done);
        Ok(())
    }

    /// Send a block to the peer, honoring the pipelining channels. An error
    /// means the block hash is unknown.
    async fn push_block_msg(
        &self,
        hash: &Hash,
        done: Option<MessageDone>,
        wait: Option<mpsc::Receiver<()>>,
    ) -> Result<(), SubsystemError> {
        let subsystems = self.server.subsystems();
        let Some(block) = subsystems.chain.block_by_hash(hash) else {
            trace!(block = %hash, "unable to fetch requested block");
            if let Some(done) = done {
                let _ = done.try_send(());
            }
            return Err(SubsystemError::new("block not found"));
        };

        if let Some(mut wait) = wait {
            let _ = wait.recv().await;
        }

        // The completion channel rides on the trailing inventory message
        // when this block finishes a maxed-out getblocks response.
        let send_inv = *self.continue_hash.lock() == Some(*hash);
        let block_done = if send_inv { None } else { done.clone() };
        self.transport()
            .queue_message(Message::Block((*block).clone()), block_done);

        // Serving the final advertised block prompts the peer to issue
        // another getblocks for the next batch by announcing our tip.
        if send_inv {
            let best = subsystems.chain.best_snapshot();
            self.transport()
                .queue_message(Message::Inv(vec![InvVect::block(best.hash)]), done);
            *self.continue_hash.lock() = None;
        }
        Ok(())
    }

    /// Reply to getblocks with an inventory of main chain block hashes.
    pub async fn on_get_blocks(self: &Arc<Self>, locator: Vec<Hash>, hash_stop: Hash) {
        // Fetch hashes after the most recent known locator entry, capped at
        // the wire limit. Unknown locators restart at the genesis block.
        let hash_list = self.server.subsystems().chain.locate_blocks(
            &locator,
            &hash_stop,
            MAX_BLOCKS_PER_MSG,
        );

        if hash_list.is_empty() {
            return;
        }

        // A full reply means the peer will be back for more; remember the
        // final hash so serving it re-triggers the peer's interest.
        if hash_list.len() == MAX_BLOCKS_PER_MSG {
            *self.continue_hash.lock() = hash_list.last().copied();
        }

        let inv: Vec<InvVect> = hash_list.into_iter().map(InvVect::block).collect();
        self.transport().queue_message(Message::Inv(inv), None);
    }

    /// Reply to getheaders. Ignored until the chain is synced.
    pub async fn on_get_headers(self: &Arc<Self>, locator: Vec<Hash>, hash_stop: Hash) {
        let subsystems = self.server.subsystems();
        if !subsystems.sync_manager.is_current() {
            return;
        }

        let headers = subsystems.chain.locate_headers(&locator, &hash_stop);
        self.transport().queue_message(Message::Headers(headers), None);
    }

    /// Disconnect the peer when committed filters are not advertised.
    ///
    /// A peer that negotiated a protocol version high enough to observe the
    /// committed filter service bit is knowingly violating the protocol and
    /// additionally accrues a persistent score.
    async fn enforce_node_cf_flag(self: &Arc<Self>, cmd: &'static str) -> bool {
        if !self.server.services().has(ServiceFlags::CF) {
            let transport = self.transport();
            if transport.protocol_version() >= NODE_CF_VERSION
                && !self.server.config().disable_banning
            {
                self.add_ban_score(100, 0, cmd).await;
                transport.disconnect();
                return false;
            }

            debug!(peer = %self, cmd, "unsupported committed filter request, disconnecting");
            transport.disconnect();
            return false;
        }
        true
    }

    /// Serve a committed filter by block hash.
    pub async fn on_get_cfilter(self: &Arc<Self>, block_hash: Hash, filter_type: FilterType) {
        if !self.enforce_node_cf_flag("getcfilter").await {
            return;
        }

        let config = self.server.config();
        let subsystems = self.server.subsystems();
        if config.no_cfilters || !subsystems.sync_manager.is_current() {
            return;
        }

        let mut filter_bytes = match subsystems
            .cf_index
            .filter_by_block_hash(&block_hash, filter_type)
        {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(block = %block_hash, error = %e, "failed to fetch cfilter");
                return;
            }
        };

        // Not in the index: the block was disconnected or lives on a side
        // chain, so rebuild the filter from the block itself.
        if filter_bytes.is_empty() {
            let Some(block) = subsystems.chain.block_by_hash(&block_hash) else {
                error!(block = %block_hash, "failed to fetch non-mainchain block");
                return;
            };
            filter_bytes = match subsystems.cf_index.build_filter(&block, filter_type) {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!(block = %block_hash, error = %e, "failed to build cfilter");
                    return;
                }
            };
        }

        trace!(block = %block_hash, "obtained committed filter");
        self.transport().queue_message(
            Message::CFilter {
                block_hash,
                filter_type,
                data: filter_bytes,
            },
            None,
        );
    }

    /// Serve committed filter headers for a block range.
    pub async fn on_get_cf_headers(
        self: &Arc<Self>,
        locator: Vec<Hash>,
        hash_stop: Hash,
        filter_type: FilterType,
    ) {
        if !self.enforce_node_cf_flag("getcfheaders").await {
            return;
        }

        let config = self.server.config();
        let subsystems = self.server.subsystems();
        if config.no_cfilters || !subsystems.sync_manager.is_current() {
            return;
        }

        let hash_list =
            subsystems
                .chain
                .locate_blocks(&locator, &hash_stop, MAX_CF_HEADERS_PER_MSG);
        if hash_list.is_empty() {
            return;
        }

        // Every requested header must resolve or the whole reply is
        // aborted; a partial cfheaders message would desynchronize the
        // requesting peer's header chain.
        let mut headers = Vec::with_capacity(hash_list.len());
        for hash in &hash_list {
            let bytes = match subsystems
                .cf_index
                .filter_header_by_block_hash(hash, filter_type)
            {
                Ok(bytes) if !bytes.is_empty() => bytes,
                Ok(_) => {
                    warn!(block = %hash, "could not obtain committed filter header");
                    return;
                }
                Err(e) => {
                    warn!(block = %hash, error = %e, "could not obtain committed filter header");
                    return;
                }
            };
            let Some(header) = Hash::from_slice(&bytes) else {
                warn!(block = %hash, "committed filter header deserialize failed");
                return;
            };
            headers.push(header);
        }

        let stop_hash = hash_list[hash_list.len() - 1];
        self.transport().queue_message(
            Message::CFHeaders {
                stop_hash,
                filter_type,
                headers,
            },
            None,
        );
    }

    /// Reply with the set of supported committed filter types.
    pub async fn on_get_cf_types(self: &Arc<Self>) {
        if !self.enforce_node_cf_flag("getcftypes").await {
            return;
        }
        if self.server.config().no_cfilters {
            return;
        }

        self.transport().queue_message(
            Message::CFTypes(vec![FilterType::Regular, FilterType::Extended]),
            None,
        );
    }

    /// Serve known addresses from the address manager, once per connection.
    pub async fn on_get_addr(self: &Arc<Self>) {
        // The simulation network must not leak addresses and become another
        // public test network.
        if self.server.config().simnet() {
            return;
        }

        // Outbound getaddr requests enable fingerprinting.
        if !self.transport().inbound() {
            return;
        }

        if self.addrs_sent.swap(true, Ordering::SeqCst) {
            trace!(peer = %self, "ignoring getaddr, already sent");
            return;
        }

        let cache = self.server.subsystems().addr_manager.address_cache();
        self.push_addr_msg(cache);
    }

    /// Record addresses advertised by the peer.
    pub async fn on_addr(self: &Arc<Self>, addrs: Vec<NetAddress>) {
        if self.server.config().simnet() {
            return;
        }

        // An addr message with no addresses is invalid.
        if addrs.is_empty() {
            error!(peer = %self, "received addr message with no addresses");
            self.transport().disconnect();
            return;
        }

        let now = SystemTime::now();
        let mut addrs = addrs;
        for na in &mut addrs {
            if !self.transport().connected() {
                return;
            }

            // Addresses claiming to be from the future are backdated five
            // days so they are among the first evicted when space is needed.
            if na.timestamp > now + Duration::from_secs(10 * 60) {
                na.timestamp = now - Duration::from_secs(5 * 24 * 60 * 60);
            }

            self.add_known_addresses(std::slice::from_ref(na));
        }

        let source = self.transport().net_address();
        self.server
            .subsystems()
            .addr_manager
            .add_addresses(addrs, &source);
    }

    /// Reply with the current best blocks and votes to mine on, once per
    /// connection.
    pub async fn on_get_mining_state(self: &Arc<Self>) {
        if self.get_mining_state_sent.swap(true, Ordering::SeqCst) {
            trace!(peer = %self, "ignoring getminingstate, already sent");
            return;
        }

        let subsystems = self.server.subsystems();
        let best = subsystems.chain.best_snapshot();

        // Before stake validation begins there are no votes; reply with a
        // blank mining state.
        let svh = self.server.config().network.stake_validation_height();
        if best.height < svh - 1 {
            self.transport()
                .queue_message(Message::MiningState(MiningStateMsg::default()), None);
            return;
        }

        // The entire generation of blocks stemming from the parent of the
        // current tip, ordered by vote count.
        let children = match subsystems.sync_manager.tip_generation() {
            Ok(children) => children,
            Err(e) => {
                warn!(
                    block = %best.hash,
                    error = %e,
                    "failed to access sync manager for a mining state request"
                );
                return;
            }
        };

        let mut block_hashes = subsystems
            .sync_manager
            .sort_parents_by_votes(&best.hash, children);
        if block_hashes.is_empty() {
            return;
        }
        block_hashes.truncate(aurum_wire::MAX_MS_BLOCKS_AT_HEAD_PER_MSG);

        let mut vote_hashes = Vec::with_capacity(MAX_MS_VOTES_AT_HEAD_PER_MSG);
        for block_hash in &block_hashes {
            let votes = subsystems.tx_pool.vote_hashes_for_block(block_hash);
            if votes.is_empty() {
                warn!(
                    block = %block_hash,
                    "no vote metadata for block in a mining state request"
                );
                return;
            }
            vote_hashes.extend(votes);
        }
        vote_hashes.truncate(MAX_MS_VOTES_AT_HEAD_PER_MSG);

        self.transport().queue_message(
            Message::MiningState(MiningStateMsg {
                height: best.height as u32,
                block_hashes,
                vote_hashes,
            }),
            None,
        );
    }

    /// Request the data advertised in a mining state message.
    pub async fn on_mining_state(self: &Arc<Self>, msg: MiningStateMsg) {
        if let Err(e) = self.server.subsystems().sync_manager.request_from_peer(
            self,
            &msg.block_hashes,
            &msg.vote_hashes,
        ) {
            warn!(peer = %self, error = %e, "couldn't handle mining state message");
        }
    }

    /// Update the server receive counter.
    pub fn on_read(&self, bytes_read: usize) {
        self.server.add_bytes_received(bytes_read as u64);
    }

    /// Update the server send counter.
    pub fn on_write(&self, bytes_written: usize) {
        self.server.add_bytes_sent(bytes_written as u64);
    }
}

impl fmt::Display for PeerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.transport.get() {
            Some(t) => {
                let direction = if t.inbound() { "inbound" } else { "outbound" };
                write!(f, "{} ({})", t.addr(), direction)
            }
            None => write!(f, "(detached peer)"),
        }
    }
}
