//! The peer-to-peer server.
//!
//! This module provides:
//! - The server facade: thin send-then-receive entry points over typed
//!   channels
//! - The peer event loop, sole owner of the peer registry
//! - Peer admission, relay fan-out, broadcast, and control queries
//! - Listener setup, address manager seeding, and the UPnP renew loop

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::rebroadcast::{rebroadcast_loop, RebroadcastRequest};
use crate::session::PeerSession;
use crate::state::PeerState;
use crate::subsystems::{ConnReq, LocalAddressPriority, Subsystems};
use crate::transport::{PeerCodecConfig, PeerId};
use crate::{
    DEFAULT_REQUIRED_SERVICES, DEFAULT_SERVICES, MAX_PROTOCOL_VERSION, USER_AGENT_NAME,
    USER_AGENT_VERSION,
};
use aurum_wire::{
    split_host_port, BlockHeader, Hash, InvType, InvVect, IpSubnet, Message, NetAddress,
    ServiceFlags, Transaction,
};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, trace, warn};

/// UPnP lease renewal interval.
const UPNP_RENEW_INTERVAL: Duration = Duration::from_secs(15 * 60);

/// UPnP port mapping lease, in seconds.
const UPNP_LEASE_SECS: u32 = 20 * 60;

/// Data accompanying a relayed inventory vector.
#[derive(Debug, Clone)]
pub enum RelayPayload {
    /// The transaction behind a tx inventory vector.
    Transaction(Arc<Transaction>),
    /// The header behind a block inventory vector, required so peers that
    /// prefer header announcements can be served.
    BlockHeader(BlockHeader),
    /// No associated data.
    None,
}

/// An inventory vector to fan out to connected peers.
pub(crate) struct RelayRequest {
    pub inv: InvVect,
    pub payload: RelayPayload,
    pub immediate: bool,
}

/// A message to broadcast to every connected peer except the excluded ones.
pub(crate) struct BroadcastRequest {
    pub message: Message,
    pub exclude: Vec<PeerId>,
}

/// Notification that a block was connected, letting peers that announced it
/// have their best height refreshed.
pub(crate) struct PeerHeightsUpdate {
    pub new_hash: Hash,
    pub new_height: i64,
    pub origin: Option<PeerId>,
}

/// Synchronous control requests answered through a reply channel.
pub(crate) enum PeerQuery {
    ConnectedCount(oneshot::Sender<usize>),
    Peers(oneshot::Sender<Vec<Arc<PeerSession>>>),
    AddedNodes(oneshot::Sender<Vec<Arc<PeerSession>>>),
    OutboundGroupCount {
        key: String,
        reply: oneshot::Sender<usize>,
    },
    ConnectNode {
        addr: String,
        permanent: bool,
        reply: oneshot::Sender<ServerResult<()>>,
    },
    DisconnectNode {
        cmp: PeerPredicate,
        reply: oneshot::Sender<ServerResult<()>>,
    },
    RemoveNode {
        cmp: PeerPredicate,
        reply: oneshot::Sender<ServerResult<()>>,
    },
}

type PeerPredicate = Box<dyn Fn(&Arc<PeerSession>) -> bool + Send>;

/// An established outbound connection handed over by the connection manager.
pub struct OutboundConn {
    pub req: ConnReq,
    pub stream: TcpStream,
}

/// Receiver halves of the event loop channels, consumed by `start`.
pub(crate) struct EventReceivers {
    pub new_peers: mpsc::Receiver<Arc<PeerSession>>,
    pub done_peers: mpsc::Receiver<Arc<PeerSession>>,
    pub ban_peers: mpsc::Receiver<Arc<PeerSession>>,
    pub relay: mpsc::Receiver<RelayRequest>,
    pub broadcast: mpsc::Receiver<BroadcastRequest>,
    pub peer_heights: mpsc::Receiver<PeerHeightsUpdate>,
    pub query: mpsc::Receiver<PeerQuery>,
}

struct ServerShared {
    config: ServerConfig,
    whitelists: Vec<IpSubnet>,
    services: ServiceFlags,
    subsystems: Subsystems,

    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    started: AtomicBool,
    shutdown: AtomicBool,

    new_peers_tx: mpsc::Sender<Arc<PeerSession>>,
    done_peers_tx: mpsc::Sender<Arc<PeerSession>>,
    ban_peers_tx: mpsc::Sender<Arc<PeerSession>>,
    relay_tx: mpsc::Sender<RelayRequest>,
    broadcast_tx: mpsc::Sender<BroadcastRequest>,
    peer_heights_tx: mpsc::Sender<PeerHeightsUpdate>,
    query_tx: mpsc::Sender<PeerQuery>,
    modify_rebroadcast_tx: mpsc::Sender<RebroadcastRequest>,
    quit: watch::Sender<bool>,

    listeners: parking_lot::Mutex<Vec<TcpListener>>,
    receivers: parking_lot::Mutex<Option<EventReceivers>>,
    modify_rebroadcast_rx: parking_lot::Mutex<Option<mpsc::Receiver<RebroadcastRequest>>>,
    outbound_conns_rx: parking_lot::Mutex<Option<mpsc::Receiver<OutboundConn>>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to the peer-to-peer server. Cheap to clone; all clones drive the
/// same server instance.
#[derive(Clone)]
pub struct Server {
    shared: Arc<ServerShared>,
}

impl Server {
    /// Build a server: bind listeners, register configured local addresses,
    /// and dial the configured persistent peers.
    ///
    /// `outbound_conns` carries connections established by the connection
    /// manager back into the server. Use [`Server::start`] to begin
    /// accepting peers.
    pub async fn new(
        config: ServerConfig,
        subsystems: Subsystems,
        outbound_conns: mpsc::Receiver<OutboundConn>,
    ) -> ServerResult<Server> {
        let mut services = DEFAULT_SERVICES;
        if config.no_cfilters {
            services = services.without(ServiceFlags::CF);
        }

        let mut whitelists = Vec::with_capacity(config.whitelists.len());
        for entry in &config.whitelists {
            match IpSubnet::parse(entry) {
                Some(subnet) => whitelists.push(subnet),
                None => warn!(subnet = %entry, "ignoring malformed whitelist entry"),
            }
        }

        let mut listeners = Vec::new();
        if !config.disable_listen {
            // An explicit external address disables discovery of bound and
            // suggested addresses.
            let discover = config.external_ips.is_empty();

            for external in &config.external_ips {
                let (host, port) = match split_host_port(external) {
                    Some((host, port)) => (host, port),
                    None => (external.clone(), config.network.default_port()),
                };
                match subsystems
                    .addr_manager
                    .host_to_net_address(&host, port, services)
                {
                    Ok(na) => {
                        if let Err(e) = subsystems
                            .addr_manager
                            .add_local_address(na, LocalAddressPriority::Manual)
                        {
                            warn!(addr = %external, error = %e, "skipping specified external IP");
                        }
                    }
                    Err(e) => warn!(addr = %external, error = %e, "not adding external IP"),
                }
            }

            for addr in &config.listeners {
                let listener = match TcpListener::bind(addr).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        warn!(addr = %addr, error = %e, "can't listen on address");
                        continue;
                    }
                };

                if discover {
                    if let Ok(local) = listener.local_addr() {
                        match subsystems.addr_manager.host_to_net_address(
                            &local.ip().to_string(),
                            local.port(),
                            services,
                        ) {
                            Ok(na) => {
                                if let Err(e) = subsystems
                                    .addr_manager
                                    .add_local_address(na, LocalAddressPriority::Bound)
                                {
                                    debug!(addr = %local, error = %e, "skipping bound address");
                                }
                            }
                            Err(e) => debug!(addr = %local, error = %e, "skipping bound address"),
                        }
                    }
                }

                listeners.push(listener);
            }

            if listeners.is_empty() {
                return Err(ServerError::NoValidListenAddress);
            }
        }

        let channel_capacity = config.max_peers.max(1);
        let (new_peers_tx, new_peers_rx) = mpsc::channel(channel_capacity);
        let (done_peers_tx, done_peers_rx) = mpsc::channel(channel_capacity);
        let (ban_peers_tx, ban_peers_rx) = mpsc::channel(channel_capacity);
        let (relay_tx, relay_rx) = mpsc::channel(channel_capacity);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(channel_capacity);
        // Height updates and queries come from callers content to block.
        let (peer_heights_tx, peer_heights_rx) = mpsc::channel(1);
        let (query_tx, query_rx) = mpsc::channel(1);
        let (modify_rebroadcast_tx, modify_rebroadcast_rx) = mpsc::channel(1);
        let (quit, _) = watch::channel(false);

        let server = Server {
            shared: Arc::new(ServerShared {
                config,
                whitelists,
                services,
                subsystems,
                bytes_received: AtomicU64::new(0),
                bytes_sent: AtomicU64::new(0),
                started: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                new_peers_tx,
                done_peers_tx,
                ban_peers_tx,
                relay_tx,
                broadcast_tx,
                peer_heights_tx,
                query_tx,
                modify_rebroadcast_tx,
                quit,
                listeners: parking_lot::Mutex::new(listeners),
                receivers: parking_lot::Mutex::new(Some(EventReceivers {
                    new_peers: new_peers_rx,
                    done_peers: done_peers_rx,
                    ban_peers: ban_peers_rx,
                    relay: relay_rx,
                    broadcast: broadcast_rx,
                    peer_heights: peer_heights_rx,
                    query: query_rx,
                })),
                modify_rebroadcast_rx: parking_lot::Mutex::new(Some(modify_rebroadcast_rx)),
                outbound_conns_rx: parking_lot::Mutex::new(Some(outbound_conns)),
                tasks: parking_lot::Mutex::new(Vec::new()),
            }),
        };

        // Dial the configured persistent peers. Connect-only mode takes
        // precedence over additional peers.
        let permanent = if server.shared.config.connect_peers.is_empty() {
            &server.shared.config.add_peers
        } else {
            &server.shared.config.connect_peers
        };
        for addr in permanent {
            if split_host_port(addr).is_none() {
                return Err(ServerError::MalformedAddress(addr.clone()));
            }
            server.shared.subsystems.conn_manager.connect(ConnReq {
                id: 0,
                addr: addr.clone(),
                permanent: true,
            });
        }

        Ok(server)
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Services the server advertises.
    pub fn services(&self) -> ServiceFlags {
        self.shared.services
    }

    pub(crate) fn subsystems(&self) -> &Subsystems {
        &self.shared.subsystems
    }

    pub(crate) fn quit_signal(&self) -> watch::Receiver<bool> {
        self.shared.quit.subscribe()
    }

    /// Local-side parameters handed to the codec for each new peer.
    pub fn peer_codec_config(&self) -> PeerCodecConfig {
        PeerCodecConfig {
            user_agent: format!("/{}:{}/", USER_AGENT_NAME, USER_AGENT_VERSION),
            services: self.shared.services,
            protocol_version: MAX_PROTOCOL_VERSION,
            disable_relay_tx: self.shared.config.blocks_only,
        }
    }

    fn is_whitelisted(&self, ip: IpAddr) -> bool {
        self.shared.whitelists.iter().any(|net| net.contains(ip))
    }

    /// Begin servicing peers. Safe to call more than once; only the first
    /// call has any effect.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return;
        }

        trace!("starting server");

        let Some(receivers) = self.shared.receivers.lock().take() else {
            return;
        };

        let mut tasks = self.shared.tasks.lock();

        let server = self.clone();
        tasks.push(tokio::spawn(server.peer_event_loop(receivers)));

        if let Some(modify_rebroadcast) = self.shared.modify_rebroadcast_rx.lock().take() {
            let server = self.clone();
            tasks.push(tokio::spawn(rebroadcast_loop(server, modify_rebroadcast)));
        }

        if let Some(outbound_conns) = self.shared.outbound_conns_rx.lock().take() {
            let server = self.clone();
            tasks.push(tokio::spawn(outbound_conn_loop(server, outbound_conns)));
        }

        for listener in self.shared.listeners.lock().drain(..) {
            let server = self.clone();
            tasks.push(tokio::spawn(accept_loop(server, listener)));
        }

        if self.shared.config.upnp {
            if let Some(nat) = self.shared.subsystems.nat.clone() {
                let server = self.clone();
                tasks.push(tokio::spawn(upnp_update_loop(server, nat)));
            }
        }
    }

    /// Shut the server down: all peers are disconnected and every background
    /// task exits. Only the first call has any effect.
    pub fn stop(&self) -> ServerResult<()> {
        if self.shared.shutdown.swap(true, Ordering::SeqCst) {
            info!("server is already in the process of shutting down");
            return Ok(());
        }

        warn!("server shutting down");
        self.shared.quit.send_replace(true);
        Ok(())
    }

    /// Block until every task spawned by `start` has exited.
    pub async fn wait_for_shutdown(&self) {
        let tasks = std::mem::take(&mut *self.shared.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
    }

    /// Adopt an accepted inbound connection.
    pub fn inbound_peer_connected(&self, conn: TcpStream) {
        let Ok(remote) = conn.peer_addr() else {
            return;
        };
        let whitelisted = self.is_whitelisted(remote.ip());
        let sp = PeerSession::new(self.clone(), false, whitelisted);
        let transport =
            self.shared
                .subsystems
                .codec
                .launch_inbound(conn, self.peer_codec_config(), sp.clone());
        sp.attach_transport(transport);
        self.spawn_peer_done_handler(sp);
    }

    /// Adopt an outbound connection established by the connection manager.
    pub fn outbound_peer_connected(&self, outbound: OutboundConn) {
        let OutboundConn { req, stream } = outbound;
        let Ok(remote) = stream.peer_addr() else {
            self.shared.subsystems.conn_manager.disconnect(req.id);
            return;
        };
        let whitelisted = self.is_whitelisted(remote.ip());
        let sp = PeerSession::new(self.clone(), req.permanent, whitelisted);
        match self.shared.subsystems.codec.launch_outbound(
            stream,
            &req.addr,
            self.peer_codec_config(),
            sp.clone(),
        ) {
            Ok(transport) => {
                sp.attach_transport(transport);
                sp.set_conn_req(req);
                self.spawn_peer_done_handler(sp.clone());
                self.shared
                    .subsystems
                    .addr_manager
                    .attempt(&sp.transport().net_address());
            }
            Err(e) => {
                debug!(addr = %req.addr, error = %e, "cannot create outbound peer");
                self.shared.subsystems.conn_manager.disconnect(req.id);
            }
        }
    }

    /// Wait for the peer's connection to drop, then notify the event loop
    /// and the sync manager.
    fn spawn_peer_done_handler(&self, sp: Arc<PeerSession>) {
        let server = self.clone();
        tokio::spawn(async move {
            let mut connected = sp.transport().connected_watch();
            let _ = connected.wait_for(|connected| !*connected).await;

            let _ = server.shared.done_peers_tx.send(sp.clone()).await;

            // Only tell the sync manager we are gone if it ever learned
            // about us.
            if sp.transport().version_known() {
                server.shared.subsystems.sync_manager.done_peer(&sp);
            }
            sp.mark_quit();
        });
    }

    // Facade entry points. Each is a thin send over a typed channel; the
    // event loop replies through the per-call channel where one exists.

    /// Hand a peer that completed version negotiation to the event loop.
    pub async fn add_peer(&self, sp: Arc<PeerSession>) {
        let _ = self.shared.new_peers_tx.send(sp).await;
    }

    /// Ban the host of the given peer.
    pub async fn ban_peer(&self, sp: Arc<PeerSession>) {
        let _ = self.shared.ban_peers_tx.send(sp).await;
    }

    /// Relay inventory to every connected peer not known to have it.
    pub async fn relay_inventory(&self, inv: InvVect, payload: RelayPayload, immediate: bool) {
        let _ = self
            .shared
            .relay_tx
            .send(RelayRequest {
                inv,
                payload,
                immediate,
            })
            .await;
    }

    /// Send a message to every connected peer except the excluded ones.
    pub async fn broadcast_message(&self, message: Message, exclude: &[PeerId]) {
        let _ = self
            .shared
            .broadcast_tx
            .send(BroadcastRequest {
                message,
                exclude: exclude.to_vec(),
            })
            .await;
    }

    /// Generate and relay inventory for transactions newly accepted into
    /// the mempool.
    pub async fn announce_new_transactions(&self, txns: &[Arc<Transaction>]) {
        for tx in txns {
            let inv = InvVect::tx(tx.hash());
            self.relay_inventory(inv, RelayPayload::Transaction(tx.clone()), false)
                .await;
        }
    }

    /// A transaction gained its first confirmation and no longer needs
    /// rebroadcasting.
    pub async fn transaction_confirmed(&self, tx: &Arc<Transaction>) {
        self.remove_rebroadcast_inventory(InvVect::tx(tx.hash()))
            .await;
    }

    /// Track inventory for periodic rebroadcast until it appears in a block.
    pub async fn add_rebroadcast_inventory(&self, inv: InvVect, payload: RelayPayload) {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let _ = self
            .shared
            .modify_rebroadcast_tx
            .send(RebroadcastRequest::Add { inv, payload })
            .await;
    }

    /// Stop rebroadcasting the given inventory.
    pub async fn remove_rebroadcast_inventory(&self, inv: InvVect) {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let _ = self
            .shared
            .modify_rebroadcast_tx
            .send(RebroadcastRequest::Del(inv))
            .await;
    }

    /// Drop pending rebroadcast entries invalidated by chain state.
    pub async fn prune_rebroadcast_inventory(&self) {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let _ = self
            .shared
            .modify_rebroadcast_tx
            .send(RebroadcastRequest::Prune)
            .await;
    }

    /// Refresh the recorded heights of peers that announced the given block.
    pub async fn update_peer_heights(&self, new_hash: Hash, new_height: i64, origin: Option<PeerId>) {
        let _ = self
            .shared
            .peer_heights_tx
            .send(PeerHeightsUpdate {
                new_hash,
                new_height,
                origin,
            })
            .await;
    }

    /// Number of currently connected peers.
    pub async fn connected_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .shared
            .query_tx
            .send(PeerQuery::ConnectedCount(reply))
            .await;
        rx.await.unwrap_or(0)
    }

    /// All connected peers.
    pub async fn peers(&self) -> Vec<Arc<PeerSession>> {
        let (reply, rx) = oneshot::channel();
        let _ = self.shared.query_tx.send(PeerQuery::Peers(reply)).await;
        rx.await.unwrap_or_default()
    }

    /// The persistent (added) peers.
    pub async fn added_node_info(&self) -> Vec<Arc<PeerSession>> {
        let (reply, rx) = oneshot::channel();
        let _ = self.shared.query_tx.send(PeerQuery::AddedNodes(reply)).await;
        rx.await.unwrap_or_default()
    }

    /// Number of version-negotiated outbound peers in the given network
    /// group.
    pub async fn outbound_group_count(&self, key: String) -> usize {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .shared
            .query_tx
            .send(PeerQuery::OutboundGroupCount { key, reply })
            .await;
        rx.await.unwrap_or(0)
    }

    /// Dial a new outbound peer, optionally keeping it connected
    /// permanently.
    pub async fn connect_node(&self, addr: String, permanent: bool) -> ServerResult<()> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .shared
            .query_tx
            .send(PeerQuery::ConnectNode {
                addr,
                permanent,
                reply,
            })
            .await;
        rx.await.unwrap_or(Err(ServerError::ShuttingDown))
    }

    /// Disconnect a peer by address.
    pub async fn disconnect_node_by_addr(&self, addr: String) -> ServerResult<()> {
        self.disconnect_node(Box::new(move |sp| sp.addr() == addr))
            .await
    }

    /// Disconnect a peer by id.
    pub async fn disconnect_node_by_id(&self, id: PeerId) -> ServerResult<()> {
        self.disconnect_node(Box::new(move |sp| sp.id() == id)).await
    }

    async fn disconnect_node(&self, cmp: PeerPredicate) -> ServerResult<()> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .shared
            .query_tx
            .send(PeerQuery::DisconnectNode { cmp, reply })
            .await;
        rx.await.unwrap_or(Err(ServerError::ShuttingDown))
    }

    /// Remove a persistent peer by address.
    pub async fn remove_node_by_addr(&self, addr: String) -> ServerResult<()> {
        self.remove_node(Box::new(move |sp| sp.addr() == addr)).await
    }

    /// Remove a persistent peer by id.
    pub async fn remove_node_by_id(&self, id: PeerId) -> ServerResult<()> {
        self.remove_node(Box::new(move |sp| sp.id() == id)).await
    }

    async fn remove_node(&self, cmp: PeerPredicate) -> ServerResult<()> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .shared
            .query_tx
            .send(PeerQuery::RemoveNode { cmp, reply })
            .await;
        rx.await.unwrap_or(Err(ServerError::ShuttingDown))
    }

    /// Add to the total bytes sent counter. Safe for concurrent access.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.shared.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Add to the total bytes received counter. Safe for concurrent access.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.shared
            .bytes_received
            .fetch_add(bytes, Ordering::Relaxed);
    }

    /// Total bytes received and sent across all peers since start.
    pub fn net_totals(&self) -> (u64, u64) {
        (
            self.shared.bytes_received.load(Ordering::Relaxed),
            self.shared.bytes_sent.load(Ordering::Relaxed),
        )
    }

    // The event loop and its handlers. The loop is the only mutator of the
    // registry maps, the ban list, and the outbound group counters.

    async fn peer_event_loop(self, mut rx: EventReceivers) {
        let subsystems = self.subsystems().clone();

        // The address and sync managers live and die with this loop.
        subsystems.addr_manager.start();
        subsystems.sync_manager.start();

        trace!("starting peer handler");

        let config = self.config();
        if !config.disable_dns_seed {
            let port = config.network.default_port();
            for seed in config.network.dns_seeds() {
                match subsystems.addr_manager.host_to_net_address(
                    seed,
                    port,
                    DEFAULT_REQUIRED_SERVICES,
                ) {
                    Ok(na) => subsystems.addr_manager.add_addresses(vec![na.clone()], &na),
                    Err(e) => warn!(seed, error = %e, "failed to seed addresses"),
                }
            }
        }
        subsystems.conn_manager.start();

        let mut state = PeerState::new();
        let mut quit = self.quit_signal();

        loop {
            tokio::select! {
                // New peers that completed version negotiation.
                Some(sp) = rx.new_peers.recv() => {
                    self.handle_add_peer(&mut state, sp);
                }

                // Disconnected peers.
                Some(sp) = rx.done_peers.recv() => {
                    self.handle_done_peer(&mut state, sp);
                }

                // Block accepted in the main chain; refresh peer heights.
                Some(update) = rx.peer_heights.recv() => {
                    self.handle_update_peer_heights(&state, update);
                }

                // Peers to ban.
                Some(sp) = rx.ban_peers.recv() => {
                    self.handle_ban_peer(&mut state, &sp);
                }

                // New inventory to relay to other peers.
                Some(request) = rx.relay.recv() => {
                    self.handle_relay(&state, &request);
                }

                // Messages to broadcast to all but the excluded peers.
                Some(request) = rx.broadcast.recv() => {
                    self.handle_broadcast(&state, request);
                }

                Some(query) = rx.query.recv() => {
                    self.handle_query(&mut state, query);
                }

                _ = quit.wait_for(|quit| *quit) => {
                    for sp in state.all_peers() {
                        trace!(peer = %sp, "shutdown peer");
                        sp.transport().disconnect();
                    }
                    break;
                }
            }
        }

        subsystems.conn_manager.stop();
        subsystems.sync_manager.stop();
        subsystems.addr_manager.stop();

        // Drain the channels so nothing is left waiting to send.
        while rx.new_peers.try_recv().is_ok() {}
        while rx.done_peers.try_recv().is_ok() {}
        while rx.ban_peers.try_recv().is_ok() {}
        while rx.relay.try_recv().is_ok() {}
        while rx.broadcast.try_recv().is_ok() {}
        while rx.peer_heights.try_recv().is_ok() {}
        while rx.query.try_recv().is_ok() {}

        trace!("peer handler done");
    }

    /// Admission control for a peer that completed version negotiation.
    fn handle_add_peer(&self, state: &mut PeerState, sp: Arc<PeerSession>) -> bool {
        if self.shared.shutdown.load(Ordering::SeqCst) {
            info!(peer = %sp, "new peer ignored, server is shutting down");
            sp.transport().disconnect();
            return false;
        }

        let addr = sp.addr();
        let Some((host, _port)) = split_host_port(&addr) else {
            debug!(addr = %addr, "can't split host from peer address");
            sp.transport().disconnect();
            return false;
        };

        // Reject hosts with an unexpired ban; clear expired entries lazily.
        if let Some(&ban_end) = state.banned.get(&host) {
            if Instant::now() < ban_end {
                debug!(
                    host = %host,
                    remaining = ?ban_end.saturating_duration_since(Instant::now()),
                    "peer is still banned, disconnecting"
                );
                sp.transport().disconnect();
                return false;
            }

            info!(host = %host, "peer is no longer banned");
            state.banned.remove(&host);
        }

        let config = self.config();
        let inbound_whitelisted = sp.is_whitelisted() && sp.inbound();
        let peer_ip = sp.transport().net_address().ip;

        // Limit connections per IP, except for whitelisted inbound peers
        // and loopback connections.
        if config.max_same_ip > 0
            && !inbound_whitelisted
            && !peer_ip.is_loopback()
            && state.connections_with_ip(&peer_ip) + 1 > config.max_same_ip
        {
            info!(peer = %sp, limit = config.max_same_ip, "max connections with ip reached");
            sp.transport().disconnect();
            return false;
        }

        // Limit the total peer count, again excepting whitelisted inbound.
        if state.count() + 1 > config.max_peers && !inbound_whitelisted {
            info!(peer = %sp, limit = config.max_peers, "max peers reached, disconnecting");
            sp.transport().disconnect();
            return false;
        }

        debug!(peer = %sp, "new peer");
        if sp.inbound() {
            state.inbound_peers.insert(sp.id(), sp);
            return true;
        }

        let na = sp.transport().net_address();
        *state.outbound_groups.entry(na.group_key()).or_insert(0) += 1;
        if sp.is_persistent() {
            state.persistent_peers.insert(sp.id(), sp.clone());
        } else {
            state.outbound_peers.insert(sp.id(), sp.clone());
        }

        // Feed the peer-reported public address into the discovery tally
        // unless some configuration makes the suggestion meaningless: a
        // proxy, an explicit external address, discovery disabled, listening
        // disabled, UPnP, or a private network.
        if config.proxy.is_some()
            || config.no_discover_ip
            || !config.external_ips.is_empty()
            || config.disable_listen
            || config.listeners.is_empty()
            || config.upnp
            || config.network.is_private()
        {
            return true;
        }

        let Some(hint) = sp.peer_na() else {
            return true;
        };
        if !self
            .shared
            .subsystems
            .addr_manager
            .is_peer_na_valid(&hint, &na)
        {
            return true;
        }

        let family = hint.family();
        state.add_suggestion(family, hint.ip.to_string());
        state.resolve_local_address(
            family,
            &*self.shared.subsystems.addr_manager,
            self.shared.services,
            config.network.default_port(),
        );

        true
    }

    /// Remove a peer that signalled it is done.
    fn handle_done_peer(&self, state: &mut PeerState, sp: Arc<PeerSession>) {
        let id = sp.id();
        let inbound = sp.inbound();
        let removed = if sp.is_persistent() {
            state.persistent_peers.remove(&id).is_some()
        } else if inbound {
            state.inbound_peers.remove(&id).is_some()
        } else {
            state.outbound_peers.remove(&id).is_some()
        };

        if removed {
            if !inbound && sp.transport().version_known() {
                let key = sp.transport().net_address().group_key();
                if let Some(count) = state.outbound_groups.get_mut(&key) {
                    *count -= 1;
                    if *count == 0 {
                        state.outbound_groups.remove(&key);
                    }
                }
            }
            if !inbound {
                if let Some(req) = sp.conn_req() {
                    self.shared.subsystems.conn_manager.disconnect(req.id);
                }
            }
            debug!(peer = %sp, "removed peer");
            return;
        }

        if let Some(req) = sp.conn_req() {
            self.shared.subsystems.conn_manager.disconnect(req.id);
        }

        // Refresh the address book's last-seen time when the handshake
        // completed in both directions.
        let transport = sp.transport();
        if transport.verack_received() && transport.version_known() {
            self.shared
                .subsystems
                .addr_manager
                .connected(&transport.net_address());
        }
    }

    /// Record a host ban.
    fn handle_ban_peer(&self, state: &mut PeerState, sp: &Arc<PeerSession>) {
        let addr = sp.addr();
        let Some((host, _port)) = split_host_port(&addr) else {
            debug!(addr = %addr, "can't split ban peer address");
            return;
        };
        let duration = self.config().ban_duration();
        info!(host = %host, peer = %sp, duration = ?duration, "banned peer");
        state.banned.insert(host, Instant::now() + duration);
    }

    /// Fan inventory out to every connected peer not known to have it.
    fn handle_relay(&self, state: &PeerState, request: &RelayRequest) {
        for sp in state.all_peers() {
            let transport = sp.transport();
            if !transport.connected() {
                continue;
            }

            // Peers that prefer header announcements get a synthesized
            // one-header message instead of block inventory.
            if request.inv.inv_type == InvType::Block && transport.wants_headers() {
                let RelayPayload::BlockHeader(ref header) = request.payload else {
                    warn!("underlying data for a header announcement is not a block header");
                    continue;
                };
                transport.queue_message(Message::Headers(vec![header.clone()]), None);
                continue;
            }

            if request.inv.inv_type == InvType::Tx && sp.relay_tx_disabled() {
                continue;
            }

            // Queue for immediate send or the next trickle batch; the codec
            // drops inventory the peer already has either way.
            if request.immediate {
                transport.queue_inventory_immediate(request.inv);
            } else {
                transport.queue_inventory(request.inv);
            }
        }
    }

    /// Send a message to every connected peer not excluded.
    fn handle_broadcast(&self, state: &PeerState, request: BroadcastRequest) {
        for sp in state.all_peers() {
            if !sp.transport().connected() {
                continue;
            }
            if request.exclude.contains(&sp.id()) {
                continue;
            }
            sp.transport().queue_message(request.message.clone(), None);
        }
    }

    /// Update the recorded height of peers that announced the block that
    /// just connected.
    fn handle_update_peer_heights(&self, state: &PeerState, update: PeerHeightsUpdate) {
        for sp in state.all_peers() {
            // The origin peer already has the updated height.
            if Some(sp.id()) == update.origin {
                continue;
            }

            let transport = sp.transport();
            let Some(announced) = transport.last_announced_block() else {
                continue;
            };

            if announced == update.new_hash {
                transport.update_last_block_height(update.new_height);
                transport.clear_last_announced_block();
            }
        }
    }

    /// Answer control queries from other subsystems.
    fn handle_query(&self, state: &mut PeerState, query: PeerQuery) {
        match query {
            PeerQuery::ConnectedCount(reply) => {
                let connected = state
                    .all_peers()
                    .filter(|sp| sp.transport().connected())
                    .count();
                let _ = reply.send(connected);
            }

            PeerQuery::Peers(reply) => {
                let peers = state
                    .all_peers()
                    .filter(|sp| sp.transport().connected())
                    .cloned()
                    .collect();
                let _ = reply.send(peers);
            }

            PeerQuery::AddedNodes(reply) => {
                let peers = state.persistent_peers.values().cloned().collect();
                let _ = reply.send(peers);
            }

            PeerQuery::OutboundGroupCount { key, reply } => {
                let count = state.outbound_groups.get(&key).copied().unwrap_or(0);
                let _ = reply.send(count);
            }

            PeerQuery::ConnectNode {
                addr,
                permanent,
                reply,
            } => {
                if state.count() >= self.config().max_peers {
                    let _ = reply.send(Err(ServerError::MaxPeersReached));
                    return;
                }
                for sp in state.persistent_peers.values() {
                    if sp.addr() == addr {
                        let result = if permanent {
                            Err(ServerError::PeerAlreadyConnected)
                        } else {
                            Err(ServerError::PeerExistsAsPermanent)
                        };
                        let _ = reply.send(result);
                        return;
                    }
                }
                if split_host_port(&addr).is_none() {
                    let _ = reply.send(Err(ServerError::MalformedAddress(addr)));
                    return;
                }

                self.shared.subsystems.conn_manager.connect(ConnReq {
                    id: 0,
                    addr,
                    permanent,
                });
                let _ = reply.send(Ok(()));
            }

            PeerQuery::RemoveNode { cmp, reply } => {
                let groups = &mut state.outbound_groups;
                let conn_manager = &self.shared.subsystems.conn_manager;
                let found = disconnect_peer(&mut state.persistent_peers, &cmp, |sp| {
                    let key = sp.transport().net_address().group_key();
                    decrement_group(groups, &key);

                    // Clearing the request stops the connection manager from
                    // scheduling a reconnect.
                    if let Some(req) = sp.take_conn_req() {
                        debug!(peer = %sp, req = req.id, "removing persistent peer");
                        conn_manager.remove(req.id);
                    }
                });

                let result = if found {
                    Ok(())
                } else {
                    Err(ServerError::PeerNotFound)
                };
                let _ = reply.send(result);
            }

            PeerQuery::DisconnectNode { cmp, reply } => {
                // Inbound peers need no bookkeeping beyond removal.
                if disconnect_peer(&mut state.inbound_peers, &cmp, |_| {}) {
                    let _ = reply.send(Ok(()));
                    return;
                }

                let groups = &mut state.outbound_groups;
                let mut found = disconnect_peer(&mut state.outbound_peers, &cmp, |sp| {
                    let key = sp.transport().net_address().group_key();
                    decrement_group(groups, &key);
                });
                if found {
                    // Multiple outbound connections can share one address;
                    // disconnect them all.
                    while found {
                        found = disconnect_peer(&mut state.outbound_peers, &cmp, |sp| {
                            let key = sp.transport().net_address().group_key();
                            decrement_group(groups, &key);
                        });
                    }
                    let _ = reply.send(Ok(()));
                    return;
                }

                let _ = reply.send(Err(ServerError::PeerNotFound));
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn take_receivers_for_test(&self) -> EventReceivers {
        self.shared
            .receivers
            .lock()
            .take()
            .expect("receivers already taken")
    }
}

fn decrement_group(groups: &mut HashMap<String, usize>, key: &str) {
    if let Some(count) = groups.get_mut(key) {
        *count -= 1;
        if *count == 0 {
            groups.remove(key);
        }
    }
}

/// Drop the first peer in `peers` matched by `cmp`, invoking `when_found`
/// with it before removal and disconnecting it afterwards. Returns whether a
/// match was found.
fn disconnect_peer(
    peers: &mut HashMap<PeerId, Arc<PeerSession>>,
    cmp: &(dyn Fn(&Arc<PeerSession>) -> bool + Send),
    mut when_found: impl FnMut(&Arc<PeerSession>),
) -> bool {
    let target = peers
        .iter()
        .find(|(_, sp)| cmp(sp))
        .map(|(id, _)| *id);
    let Some(id) = target else {
        return false;
    };
    if let Some(sp) = peers.remove(&id) {
        when_found(&sp);
        sp.transport().disconnect();
        return true;
    }
    false
}

/// Accept inbound connections until shutdown.
async fn accept_loop(server: Server, listener: TcpListener) {
    let mut quit = server.quit_signal();
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, addr)) => {
                    debug!(addr = %addr, "incoming connection");
                    server.inbound_peer_connected(stream);
                }
                Err(e) => error!(error = %e, "accept error"),
            },
            _ = quit.wait_for(|quit| *quit) => break,
        }
    }
}

/// Adopt outbound connections established by the connection manager until
/// shutdown.
async fn outbound_conn_loop(server: Server, mut conns: mpsc::Receiver<OutboundConn>) {
    let mut quit = server.quit_signal();
    loop {
        tokio::select! {
            Some(outbound) = conns.recv() => server.outbound_peer_connected(outbound),
            _ = quit.wait_for(|quit| *quit) => break,
        }
    }
}

/// Keep the UPnP port mapping alive, registering the discovered external
/// address as a local address once.
async fn upnp_update_loop(server: Server, nat: Arc<dyn crate::subsystems::NatDevice>) {
    let port = server.config().network.default_port();
    let services = server.services();
    let mut first = true;

    // Map immediately, then renew every lease interval.
    let timer = sleep(Duration::ZERO);
    tokio::pin!(timer);
    let mut quit = server.quit_signal();

    loop {
        tokio::select! {
            () = &mut timer => {
                match nat.add_port_mapping("tcp", port, port, "aurum listen port", UPNP_LEASE_SECS)
                {
                    Ok(listen_port) => {
                        if first {
                            match nat.external_address() {
                                Ok(ip) => {
                                    let na = NetAddress::new(ip, listen_port, services);
                                    match server
                                        .subsystems()
                                        .addr_manager
                                        .add_local_address(na.clone(), LocalAddressPriority::Upnp)
                                    {
                                        Ok(()) => {
                                            warn!(addr = %na.key(), "successfully bound via UPnP");
                                            first = false;
                                        }
                                        Err(e) => {
                                            warn!(error = %e, "failed to add UPnP local address");
                                        }
                                    }
                                }
                                Err(e) => warn!(error = %e, "UPnP can't get external address"),
                            }
                        }
                    }
                    Err(e) => warn!(error = %e, "can't add UPnP port mapping"),
                }
                timer.as_mut().reset(tokio::time::Instant::now() + UPNP_RENEW_INTERVAL);
            }
            _ = quit.wait_for(|quit| *quit) => break,
        }
    }

    match nat.delete_port_mapping("tcp", port, port) {
        Ok(()) => debug!("successfully removed UPnP port mapping"),
        Err(e) => warn!(error = %e, "unable to remove UPnP port mapping"),
    }
}
