//! Routing errors.

use mesh_session::ConnectionError;
use mesh_storage::StorageError;
use mesh_wire::NodeId;
use thiserror::Error;

/// Errors returned by [`crate::MeshRouter`]
#[derive(Error, Debug)]
pub enum RoutingError {
    /// No link or route to the destination; discovery has been started
    #[error("no route to {0}")]
    UnreachableDestination(NodeId),

    /// Packet reached the hop limit
    #[error("hop limit exceeded ({hop_count} >= {max_hops})")]
    HopLimitExceeded {
        /// Hops travelled
        hop_count: u8,
        /// Configured limit
        max_hops: u8,
    },

    /// Route parameters are unusable
    #[error("invalid route: {0}")]
    InvalidRoute(String),

    /// Connection manager failure
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// Storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),
}
