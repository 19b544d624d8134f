//! In-memory storage backend for development and testing

use crate::{Connection, ConnectionStore, Route, RouteStore, StorageError};
use async_trait::async_trait;
use dashmap::DashMap;
use mesh_wire::{ConnectionId, NodeId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// In-memory connection store
#[derive(Clone, Default)]
pub struct MemoryConnectionStore {
    connections: Arc<DashMap<ConnectionId, Connection>>,
}

impl MemoryConnectionStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with records loaded elsewhere
    pub fn from_records(records: impl IntoIterator<Item = Connection>) -> Self {
        let store = Self::new();
        for connection in records {
            store.connections.insert(connection.connection_id, connection);
        }
        store
    }

    pub(crate) fn records(&self) -> Vec<Connection> {
        self.connections.iter().map(|e| e.value().clone()).collect()
    }
}

#[async_trait]
impl ConnectionStore for MemoryConnectionStore {
    async fn put(&self, connection: Connection) -> Result<(), StorageError> {
        trace!(
            "Connection put id={} state={}",
            connection.connection_id.short(),
            connection.state
        );
        self.connections.insert(connection.connection_id, connection);
        Ok(())
    }

    async fn get(&self, id: &ConnectionId) -> Result<Option<Connection>, StorageError> {
        Ok(self.connections.get(id).map(|c| c.clone()))
    }

    async fn update(
        &self,
        id: &ConnectionId,
        mutate: &mut (dyn for<'c> FnMut(&'c mut Connection) + Send),
    ) -> Result<Option<Connection>, StorageError> {
        let Some(mut entry) = self.connections.get_mut(id) else {
            return Ok(None);
        };
        mutate(entry.value_mut());
        Ok(Some(entry.value().clone()))
    }

    async fn remove(&self, id: &ConnectionId) -> Result<Option<Connection>, StorageError> {
        Ok(self.connections.remove(id).map(|(_, c)| c))
    }

    async fn list(&self) -> Result<Vec<Connection>, StorageError> {
        Ok(self.records())
    }
}

/// In-memory route store.
///
/// Candidates are grouped per destination; a secondary index maps each next
/// hop to the destinations routed through it.
#[derive(Clone, Default)]
pub struct MemoryRouteStore {
    /// destination -> next hop -> route
    routes: Arc<DashMap<NodeId, HashMap<NodeId, Route>>>,
    /// next hop -> destinations
    by_next_hop: Arc<DashMap<NodeId, HashSet<NodeId>>>,
}

impl MemoryRouteStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the store with records loaded elsewhere
    pub fn from_records(records: impl IntoIterator<Item = Route>) -> Self {
        let store = Self::new();
        for route in records {
            store.insert(route);
        }
        store
    }

    pub(crate) fn records(&self) -> Vec<Route> {
        self.routes
            .iter()
            .flat_map(|e| e.value().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    fn insert(&self, route: Route) {
        let destination = route.destination_id;
        let next_hop = route.next_hop_id;
        self.routes
            .entry(destination)
            .or_default()
            .insert(next_hop, route);
        self.by_next_hop
            .entry(next_hop)
            .or_default()
            .insert(destination);
    }

    fn unindex(&self, next_hop: &NodeId, destination: &NodeId) {
        if let Some(mut dests) = self.by_next_hop.get_mut(next_hop) {
            dests.remove(destination);
        }
        self.by_next_hop.remove_if(next_hop, |_, dests| dests.is_empty());
    }
}

#[async_trait]
impl RouteStore for MemoryRouteStore {
    async fn upsert(&self, route: Route) -> Result<(), StorageError> {
        trace!(
            "Route upsert dest={} via={} hops={} cost={:.3}",
            route.destination_id.short(),
            route.next_hop_id.short(),
            route.hop_count,
            route.path_cost
        );
        self.insert(route);
        Ok(())
    }

    async fn get_for_destination(
        &self,
        destination: &NodeId,
        now: u64,
    ) -> Result<Vec<Route>, StorageError> {
        Ok(self
            .routes
            .get(destination)
            .map(|candidates| {
                candidates
                    .values()
                    .filter(|r| !r.is_expired(now))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_via_next_hop(
        &self,
        next_hop: &NodeId,
        now: u64,
    ) -> Result<Vec<Route>, StorageError> {
        // Copy the index entry out before touching the primary map
        let destinations: Vec<NodeId> = match self.by_next_hop.get(next_hop) {
            Some(dests) => dests.iter().copied().collect(),
            None => return Ok(Vec::new()),
        };

        let mut results = Vec::with_capacity(destinations.len());
        for destination in destinations {
            if let Some(candidates) = self.routes.get(&destination) {
                if let Some(route) = candidates.get(next_hop) {
                    if !route.is_expired(now) {
                        results.push(route.clone());
                    }
                }
            }
        }
        Ok(results)
    }

    async fn list(&self, now: u64) -> Result<Vec<Route>, StorageError> {
        Ok(self
            .records()
            .into_iter()
            .filter(|r| !r.is_expired(now))
            .collect())
    }

    async fn remove_destination(&self, destination: &NodeId) -> Result<usize, StorageError> {
        let Some((_, candidates)) = self.routes.remove(destination) else {
            return Ok(0);
        };
        for next_hop in candidates.keys() {
            self.unindex(next_hop, destination);
        }
        debug!(
            "Removed {} route candidates for {}",
            candidates.len(),
            destination.short()
        );
        Ok(candidates.len())
    }

    async fn remove_candidate(
        &self,
        destination: &NodeId,
        next_hop: &NodeId,
    ) -> Result<bool, StorageError> {
        let removed = match self.routes.get_mut(destination) {
            Some(mut candidates) => candidates.remove(next_hop).is_some(),
            None => false,
        };
        self.routes
            .remove_if(destination, |_, candidates| candidates.is_empty());
        if removed {
            self.unindex(next_hop, destination);
        }
        Ok(removed)
    }

    async fn purge_expired(&self, now: u64) -> Result<usize, StorageError> {
        let expired: Vec<(NodeId, NodeId)> = self
            .records()
            .into_iter()
            .filter(|r| r.is_expired(now))
            .map(|r| (r.destination_id, r.next_hop_id))
            .collect();

        let mut purged = 0;
        for (destination, next_hop) in expired {
            if self.remove_candidate(&destination, &next_hop).await? {
                purged += 1;
            }
        }
        if purged > 0 {
            debug!("Purged {} expired routes", purged);
        }
        Ok(purged)
    }
}
