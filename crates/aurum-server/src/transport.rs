//! Interface to the framed peer codec.
//!
//! The codec owns the TCP connection, message framing, the version/verack
//! handshake, inventory trickle batching, and the per-peer known inventory
//! filter. The server drives it through [`PeerTransport`] and receives wire
//! messages back through the [`crate::PeerSession`] callbacks.

use crate::error::SubsystemError;
use crate::session::PeerSession;
use aurum_wire::{Hash, InvVect, Message, NetAddress, ServiceFlags};
use std::fmt;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

/// Identifier assigned to each peer by the codec, monotonically increasing
/// over the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Completion signal for a queued message. The codec sends exactly one unit
/// after the message has been written to the wire. Senders are created with
/// capacity one so the codec's write task never blocks on the signal.
pub type MessageDone = mpsc::Sender<()>;

/// Handle to one peer connection inside the codec.
pub trait PeerTransport: Send + Sync {
    /// Codec-assigned peer id.
    fn id(&self) -> PeerId;

    /// Remote address in `host:port` form.
    fn addr(&self) -> String;

    /// Remote network address.
    fn net_address(&self) -> NetAddress;

    /// Whether the connection was accepted rather than dialed.
    fn inbound(&self) -> bool;

    /// Whether the connection is still alive.
    fn connected(&self) -> bool;

    /// Watch that flips to `false` when the connection closes.
    fn connected_watch(&self) -> watch::Receiver<bool>;

    /// Tear the connection down. Idempotent.
    fn disconnect(&self);

    /// Negotiated protocol version.
    fn protocol_version(&self) -> u32;

    /// Services advertised by the remote peer.
    fn services(&self) -> ServiceFlags;

    /// Whether a version message has been received from the peer.
    fn version_known(&self) -> bool;

    /// Whether the peer acknowledged our version.
    fn verack_received(&self) -> bool;

    /// Whether the peer asked for block announcements as headers instead of
    /// inventory messages.
    fn wants_headers(&self) -> bool;

    /// Whether the peer is already believed to have the inventory.
    fn is_known_inventory(&self, inv: &InvVect) -> bool;

    /// Record that the peer has the inventory.
    fn add_known_inventory(&self, inv: &InvVect);

    /// The most recent block the peer announced, if any.
    fn last_announced_block(&self) -> Option<Hash>;

    /// Clear the last announced block marker.
    fn clear_last_announced_block(&self);

    /// Best block height the peer is known to have.
    fn last_block_height(&self) -> i64;

    /// Update the peer's best known block height.
    fn update_last_block_height(&self, height: i64);

    /// Enqueue a message on the peer's send queue. Messages are written in
    /// queue order; `done` fires once this message is on the wire.
    fn queue_message(&self, msg: Message, done: Option<MessageDone>);

    /// Enqueue inventory for the next trickle batch. Inventory the peer is
    /// already known to have is silently dropped.
    fn queue_inventory(&self, inv: InvVect);

    /// Relay inventory immediately, bypassing the trickle timer.
    fn queue_inventory_immediate(&self, inv: InvVect);

    /// Push an addr message, chunking and enforcing wire limits. Returns the
    /// subset of addresses actually sent.
    fn push_addresses(&self, addrs: Vec<NetAddress>) -> Result<Vec<NetAddress>, SubsystemError>;
}

/// Local-side parameters the codec needs to negotiate on our behalf.
#[derive(Debug, Clone)]
pub struct PeerCodecConfig {
    pub user_agent: String,
    pub services: ServiceFlags,
    pub protocol_version: u32,
    pub disable_relay_tx: bool,
}

/// Factory turning accepted or dialed TCP connections into driven peers.
///
/// Implementations spawn the read/write tasks, perform the handshake, and
/// dispatch inbound wire messages to the session's callbacks.
pub trait PeerCodec: Send + Sync {
    /// Adopt an accepted inbound connection.
    fn launch_inbound(
        &self,
        conn: TcpStream,
        config: PeerCodecConfig,
        session: Arc<PeerSession>,
    ) -> Arc<dyn PeerTransport>;

    /// Adopt a dialed outbound connection to `addr`.
    fn launch_outbound(
        &self,
        conn: TcpStream,
        addr: &str,
        config: PeerCodecConfig,
        session: Arc<PeerSession>,
    ) -> Result<Arc<dyn PeerTransport>, SubsystemError>;
}
