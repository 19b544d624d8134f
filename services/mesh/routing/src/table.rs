//! Route queries over the node's route store.

use mesh_storage::{Route, RouteStore, StorageError};
use mesh_wire::{now_millis, NodeId};
use std::collections::HashMap;
use std::sync::Arc;

/// Read side of the route store.
///
/// Expired candidates are never returned. Ranking follows [`Route::rank`]:
/// lowest `path_cost` first, ties broken by higher `path_quality`.
#[derive(Clone)]
pub struct RoutingTable {
    store: Arc<dyn RouteStore>,
}

impl RoutingTable {
    /// Wrap a route store
    pub fn new(store: Arc<dyn RouteStore>) -> Self {
        Self { store }
    }

    /// Underlying store
    pub fn store(&self) -> &Arc<dyn RouteStore> {
        &self.store
    }

    /// Current route to `destination`
    pub async fn get_best_route(
        &self,
        destination: &NodeId,
    ) -> Result<Option<Route>, StorageError> {
        Ok(self
            .store
            .get_for_destination(destination, now_millis())
            .await?
            .into_iter()
            .min_by(Route::rank))
    }

    /// Every candidate for `destination`, cheapest first
    pub async fn get_all_routes(&self, destination: &NodeId) -> Result<Vec<Route>, StorageError> {
        let mut routes = self
            .store
            .get_for_destination(destination, now_millis())
            .await?;
        routes.sort_by(Route::rank);
        Ok(routes)
    }

    /// Candidates forwarding through `next_hop`
    pub async fn get_routes_through(&self, next_hop: &NodeId) -> Result<Vec<Route>, StorageError> {
        self.store.get_via_next_hop(next_hop, now_millis()).await
    }

    /// Best candidate per destination, cheapest first
    pub async fn get_all_best_routes(&self) -> Result<Vec<Route>, StorageError> {
        let mut best: HashMap<NodeId, Route> = HashMap::new();
        for route in self.store.list(now_millis()).await? {
            match best.get(&route.destination_id) {
                Some(current) if Route::rank(current, &route).is_le() => {}
                _ => {
                    best.insert(route.destination_id, route);
                }
            }
        }

        let mut routes: Vec<Route> = best.into_values().collect();
        routes.sort_by(Route::rank);
        Ok(routes)
    }
}
