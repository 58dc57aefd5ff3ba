//! Server error types.

use thiserror::Error;

/// Errors surfaced by the server facade and bootstrap.
#[derive(Error, Debug)]
pub enum ServerError {
    /// No listener could be bound at startup.
    #[error("no valid listen address")]
    NoValidListenAddress,

    /// A control operation targeted a peer that is not connected.
    #[error("peer not found")]
    PeerNotFound,

    /// The peer limit has been reached.
    #[error("max peers reached")]
    MaxPeersReached,

    /// A connect request matched an already connected persistent peer.
    #[error("peer already connected")]
    PeerAlreadyConnected,

    /// A one-shot connect request matched an existing persistent peer.
    #[error("peer exists as a permanent peer")]
    PeerExistsAsPermanent,

    /// A peer address could not be parsed.
    #[error("malformed peer address: {0}")]
    MalformedAddress(String),

    /// The server is shutting down.
    #[error("server is shutting down")]
    ShuttingDown,

    /// An external collaborator reported an error.
    #[error("subsystem error: {0}")]
    Subsystem(#[from] SubsystemError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Opaque error reported by an external subsystem (chain, mempool, address
/// manager, codec, NAT device).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct SubsystemError(pub String);

impl SubsystemError {
    /// Build from anything displayable.
    pub fn new(msg: impl std::fmt::Display) -> Self {
        Self(msg.to_string())
    }
}
