//! Connection manager errors.

use crate::transport::TransportError;
use mesh_identity::IdentityError;
use mesh_storage::{ConnectionState, StorageError};
use mesh_wire::{ConnectionId, NodeId};
use thiserror::Error;

/// Errors returned by [`crate::ConnectionManager`]
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// A connected link to the peer already exists
    #[error("already connected to {0}")]
    AlreadyConnected(NodeId),

    /// Connected link count is at the limit
    #[error("connection limit reached ({limit})")]
    ConnectionLimitReached {
        /// Configured maximum
        limit: usize,
    },

    /// Handshake did not prove the peer's identity
    #[error("invalid handshake from {peer}: {reason}")]
    InvalidPeerSignature {
        /// Peer the handshake claimed to come from
        peer: NodeId,
        /// What failed
        #[source]
        reason: IdentityError,
    },

    /// Peer is the local node
    #[error("refusing to connect to self")]
    SelfConnection,

    /// No such link
    #[error("connection {0} not found")]
    NotFound(ConnectionId),

    /// Link is in the wrong state for the operation
    #[error("connection {id} is {actual}, expected {expected}")]
    InvalidState {
        /// Link
        id: ConnectionId,
        /// State found
        actual: ConnectionState,
        /// State required
        expected: ConnectionState,
    },

    /// Transport rejected a send
    #[error("send to {peer} failed: {source}")]
    SendFailed {
        /// Peer
        peer: NodeId,
        /// Transport failure
        #[source]
        source: TransportError,
    },

    /// Storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}
