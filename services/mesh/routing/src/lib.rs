//! Route discovery, route tables and packet forwarding for mesh.
//!
//! [`MeshRouter`] forwards [`mesh_wire::DataPacket`]s over the links owned by
//! a [`mesh_session::ConnectionManager`]. Routes are learned on demand through
//! a request/reply flood and proactively from neighbor table exchanges, and
//! persisted in a [`mesh_storage::RouteStore`] read through [`RoutingTable`].
//! [`MeshNode`] runs a router: it dispatches inbound envelopes and schedules
//! the periodic health, cleanup and refresh passes.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod discovery;
pub mod error;
pub mod mesh_router;
pub mod node;
pub mod request_id;
pub mod router;
pub mod table;

pub use config::RouterConfig;
pub use discovery::PendingDiscovery;
pub use error::RoutingError;
pub use mesh_router::{CleanupReport, MeshRouter};
pub use node::{MeshNode, ScheduleConfig};
pub use request_id::{OsRequestIds, RequestIdSource, SequentialRequestIds};
pub use router::{DropReason, RouterStats, RoutingDecision};
pub use table::RoutingTable;
