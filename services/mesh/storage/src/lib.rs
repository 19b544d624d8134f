//! Connection and route storage for mesh with pluggable backends.
//!
//! Each node owns one [`Storage`]: a [`ConnectionStore`] holding its direct
//! links and a [`RouteStore`] holding every route candidate it has learned.
//! Backends are in-memory (tests, simulation) or file snapshots that survive
//! a restart.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;
pub mod model;

use async_trait::async_trait;
use mesh_wire::{ConnectionId, NodeId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

pub use backend::file::{FileConnectionStore, FileRouteStore, FileStoreConfig};
pub use backend::mem::{MemoryConnectionStore, MemoryRouteStore};
pub use model::{Connection, ConnectionState, QualityMetrics, Route};

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Invalid operation
    #[error("Invalid operation: {0}")]
    Invalid(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Direct links of one node, keyed by [`ConnectionId`]
#[async_trait]
pub trait ConnectionStore: Send + Sync {
    /// Insert or replace a connection record
    async fn put(&self, connection: Connection) -> Result<(), StorageError>;

    /// Fetch a connection by ID
    async fn get(&self, id: &ConnectionId) -> Result<Option<Connection>, StorageError>;

    /// Apply `mutate` to a stored connection atomically, returning the result.
    ///
    /// A missing record stays missing: `None` is returned and nothing is
    /// inserted.
    async fn update(
        &self,
        id: &ConnectionId,
        mutate: &mut (dyn for<'c> FnMut(&'c mut Connection) + Send),
    ) -> Result<Option<Connection>, StorageError>;

    /// Delete a connection, returning the removed record
    async fn remove(&self, id: &ConnectionId) -> Result<Option<Connection>, StorageError>;

    /// Every stored connection regardless of state
    async fn list(&self) -> Result<Vec<Connection>, StorageError>;

    /// Connections of `local_id` in the `Connected` state
    async fn list_connected(&self, local_id: &NodeId) -> Result<Vec<Connection>, StorageError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|c| c.local_id == *local_id && c.is_connected())
            .collect())
    }

    /// Persist pending writes (no-op for volatile backends)
    async fn snapshot(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Route candidates of one node, keyed by (destination, next hop).
///
/// Queries taking `now` skip routes whose `expires_at` is in the past.
#[async_trait]
pub trait RouteStore: Send + Sync {
    /// Insert a candidate, replacing any with the same destination and next hop
    async fn upsert(&self, route: Route) -> Result<(), StorageError>;

    /// Unexpired candidates for a destination
    async fn get_for_destination(
        &self,
        destination: &NodeId,
        now: u64,
    ) -> Result<Vec<Route>, StorageError>;

    /// Unexpired candidates forwarding through `next_hop`
    async fn get_via_next_hop(
        &self,
        next_hop: &NodeId,
        now: u64,
    ) -> Result<Vec<Route>, StorageError>;

    /// Every unexpired candidate
    async fn list(&self, now: u64) -> Result<Vec<Route>, StorageError>;

    /// Delete every candidate for a destination, returning how many were removed
    async fn remove_destination(&self, destination: &NodeId) -> Result<usize, StorageError>;

    /// Delete one candidate, returning whether it existed
    async fn remove_candidate(
        &self,
        destination: &NodeId,
        next_hop: &NodeId,
    ) -> Result<bool, StorageError>;

    /// Drop candidates expired at `now`, returning how many were removed
    async fn purge_expired(&self, now: u64) -> Result<usize, StorageError>;

    /// Persist pending writes (no-op for volatile backends)
    async fn snapshot(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Storage backend configuration
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum StorageMode {
    /// In-memory storage (dev/tests only)
    #[default]
    InMemory,
    /// JSON snapshot files under a data directory
    File {
        /// Data directory path
        data_dir: String,
        /// Snapshot frequency (1 = every write, N = every N writes)
        #[serde(default = "default_snapshot_every")]
        snapshot_every: u32,
    },
}

fn default_snapshot_every() -> u32 {
    1
}

impl StorageMode {
    /// Scope the mode to one node so several nodes can share a data directory
    pub fn for_node(&self, node: &NodeId) -> StorageMode {
        match self {
            StorageMode::InMemory => StorageMode::InMemory,
            StorageMode::File {
                data_dir,
                snapshot_every,
            } => StorageMode::File {
                data_dir: PathBuf::from(data_dir)
                    .join(node.to_hex())
                    .to_string_lossy()
                    .into_owned(),
                snapshot_every: *snapshot_every,
            },
        }
    }
}

/// Combined storage of one node
#[derive(Clone)]
pub struct Storage {
    /// Direct links
    pub connections: Arc<dyn ConnectionStore>,
    /// Route candidates
    pub routes: Arc<dyn RouteStore>,
}

impl Storage {
    /// Volatile storage
    pub fn in_memory() -> Self {
        Storage {
            connections: Arc::new(MemoryConnectionStore::new()),
            routes: Arc::new(MemoryRouteStore::new()),
        }
    }

    /// Create storage from configuration
    pub async fn from_mode(mode: StorageMode) -> Result<Self, StorageError> {
        match mode {
            StorageMode::InMemory => Ok(Self::in_memory()),
            StorageMode::File {
                data_dir,
                snapshot_every,
            } => {
                if snapshot_every == 0 {
                    return Err(StorageError::Invalid(
                        "snapshot_every must be at least 1".to_string(),
                    ));
                }
                let config = FileStoreConfig {
                    data_dir: data_dir.into(),
                    snapshot_every,
                };
                Ok(Storage {
                    connections: Arc::new(FileConnectionStore::open(config.clone()).await?),
                    routes: Arc::new(FileRouteStore::open(config).await?),
                })
            }
        }
    }

    /// Persist both stores
    pub async fn snapshot(&self) -> Result<(), StorageError> {
        self.connections.snapshot().await?;
        self.routes.snapshot().await
    }
}
