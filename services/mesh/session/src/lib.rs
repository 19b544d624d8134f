//! Direct peer links for mesh: lifecycle, quality scoring, health, transport and events.
//!
//! [`ConnectionManager`] owns the links between the local node and its
//! neighbors. It verifies signed handshakes, enforces the connection limit,
//! scores links from transport measurements and closes idle or poor links.
//! Messages leave through a [`Transport`]; state changes are published as
//! [`MeshEvent`]s on a [`MeshEventNotifier`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use mesh_identity::{Ed25519Verifier, NodeIdentity};
//! use mesh_session::{ChannelHub, ConnectionConfig, ConnectionManager, MeshEventNotifier};
//! use mesh_storage::MemoryConnectionStore;
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), mesh_session::ConnectionError> {
//! let identity = NodeIdentity::generate();
//! let hub = ChannelHub::new();
//! let (transport, _inbound) = hub.register(identity.node_id());
//! let events = MeshEventNotifier::new(identity.node_id(), 1024);
//!
//! let manager = ConnectionManager::new(
//!     identity,
//!     ConnectionConfig::default(),
//!     Arc::new(MemoryConnectionStore::new()),
//!     Arc::new(transport),
//!     Arc::new(Ed25519Verifier),
//!     events,
//! );
//!
//! let peer = NodeIdentity::generate().node_id();
//! let conn = manager.connect_to_peer(peer, BTreeMap::new()).await?;
//! manager.mark_established(&conn.connection_id, Default::default()).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod event;
pub mod manager;
pub mod quality;
pub mod transport;

pub use config::ConnectionConfig;
pub use error::ConnectionError;
pub use event::{CloseReason, EventRecord, MeshEvent, MeshEventNotifier};
pub use manager::{establish_link, ConnectionManager, HealthReport};
pub use quality::quality_score;
pub use transport::{ChannelHub, ChannelTransport, Envelope, Transport, TransportError};
