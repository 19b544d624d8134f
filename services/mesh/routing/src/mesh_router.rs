//! Packet forwarding and on-demand route discovery.
//!
//! A packet is delivered locally, sent over a direct link, or forwarded to
//! the next hop of the best known route. With none of those available the
//! router floods a route request (RREQ) to its neighbors. Every node the
//! request reaches learns a reverse route to the requester; the destination,
//! or any node that already knows a way there, answers with a route reply
//! (RREP) that travels back along those reverse routes, installing a forward
//! route at each hop.
//!
//! Neighbors also trade summaries of their best routes periodically, which
//! fills tables before any packet needs them.

use crate::config::RouterConfig;
use crate::discovery::{DiscoveryTracker, PendingDiscovery};
use crate::error::RoutingError;
use crate::request_id::RequestIdSource;
use crate::router::{DropReason, RouterCounters, RouterStats, RoutingDecision};
use crate::table::RoutingTable;
use dashmap::DashMap;
use mesh_session::{ConnectionManager, MeshEvent, MeshEventNotifier};
use mesh_storage::Route;
use mesh_topology::{link_cost, Graph, LinkQualities, OptimalPath, PathOptimizer};
use mesh_wire::{
    now_millis, AdvertisedRoute, DataPacket, MeshMessage, NodeId, RouteReply, RouteRequest,
    RouteTableAdvert, RouteTableRequest,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone)]
struct CachedRoute {
    route: Route,
    cached_at: u64,
}

/// Outcome of one [`MeshRouter::cleanup_expired_routes`] pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Expired candidates deleted from storage
    pub routes_purged: usize,
    /// Request IDs dropped from the dedup window
    pub requests_forgotten: usize,
    /// Discoveries declared failed
    pub discoveries_expired: usize,
}

/// Routes packets for one node
pub struct MeshRouter {
    local_id: NodeId,
    config: RouterConfig,
    connections: Arc<ConnectionManager>,
    table: RoutingTable,
    events: MeshEventNotifier,
    request_ids: Arc<dyn RequestIdSource>,
    optimizer: PathOptimizer,
    cache: DashMap<NodeId, CachedRoute>,
    discovery: DiscoveryTracker,
    counters: RouterCounters,
}

impl MeshRouter {
    /// Create a router over `connections` and `table`
    pub fn new(
        config: RouterConfig,
        connections: Arc<ConnectionManager>,
        table: RoutingTable,
        request_ids: Arc<dyn RequestIdSource>,
    ) -> Self {
        let discovery = DiscoveryTracker::new(config.rreq_dedup_ttl());
        Self {
            local_id: connections.local_id(),
            events: connections.events().clone(),
            config,
            connections,
            table,
            request_ids,
            optimizer: PathOptimizer::new(),
            cache: DashMap::new(),
            discovery,
            counters: RouterCounters::default(),
        }
    }

    /// Local node ID
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Configuration in use
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// Route queries
    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    /// Connection manager the router sends through
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Deliver, send or forward a packet.
    ///
    /// When no path is known a discovery is started in the background and
    /// `UnreachableDestination` is returned; the packet itself is dropped.
    pub async fn route_packet(
        self: &Arc<Self>,
        packet: DataPacket,
    ) -> Result<RoutingDecision, RoutingError> {
        let destination = packet.destination_id;

        if destination == self.local_id {
            debug!(
                "Packet from {} delivered locally after {} hops",
                packet.source_id.short(),
                packet.hop_count
            );
            self.counters.record(&RoutingDecision::Local);
            self.events.notify(MeshEvent::PacketReceived { packet });
            return Ok(RoutingDecision::Local);
        }

        if packet.hop_count >= self.config.max_hops {
            debug!(
                "Dropping packet for {}: {} hops",
                destination.short(),
                packet.hop_count
            );
            self.counters.record_drop(DropReason::HopLimitExceeded);
            return Err(RoutingError::HopLimitExceeded {
                hop_count: packet.hop_count,
                max_hops: self.config.max_hops,
            });
        }

        let outbound = MeshMessage::Packet(packet.stamped(self.local_id));

        if self.connections.is_connected_to(&destination).await? {
            return match self.connections.send_to(&destination, &outbound).await {
                Ok(_) => {
                    let decision = RoutingDecision::Direct(destination);
                    self.counters.record(&decision);
                    Ok(decision)
                }
                Err(e) => {
                    self.counters.record_drop(DropReason::SendFailed);
                    Err(e.into())
                }
            };
        }

        if let Some(route) = self.find_route(&destination).await? {
            let next_hop = route.next_hop_id;
            return match self.connections.send_to(&next_hop, &outbound).await {
                Ok(_) => {
                    trace!(
                        "Forwarded packet for {} via {}",
                        destination.short(),
                        next_hop.short()
                    );
                    let decision = RoutingDecision::Forwarded(next_hop);
                    self.counters.record(&decision);
                    Ok(decision)
                }
                Err(e) => {
                    // Re-read storage next time
                    self.cache.remove(&destination);
                    self.counters.record_drop(DropReason::SendFailed);
                    Err(e.into())
                }
            };
        }

        self.counters.record_drop(DropReason::NoRoute);
        let router = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = router.discover_route(destination).await {
                warn!("Discovery for {} failed to start: {}", destination.short(), e);
            }
        });
        Err(RoutingError::UnreachableDestination(destination))
    }

    /// Best route to `destination`, from the cache or storage
    pub async fn find_route(&self, destination: &NodeId) -> Result<Option<Route>, RoutingError> {
        let now = now_millis();
        let cache_ttl = self.config.route_cache_ttl().as_millis() as u64;

        let cached = self.cache.get(destination).map(|entry| entry.clone());
        if let Some(entry) = cached {
            if now.saturating_sub(entry.cached_at) <= cache_ttl && !entry.route.is_expired(now) {
                return Ok(Some(entry.route));
            }
            self.cache.remove(destination);
        }

        let best = self.table.get_best_route(destination).await?;
        if let Some(route) = &best {
            self.cache.insert(
                *destination,
                CachedRoute {
                    route: route.clone(),
                    cached_at: now,
                },
            );
        }
        Ok(best)
    }

    async fn refresh_cache(&self, destination: &NodeId) -> Result<(), RoutingError> {
        match self.table.get_best_route(destination).await? {
            Some(route) => {
                self.cache.insert(
                    *destination,
                    CachedRoute {
                        route,
                        cached_at: now_millis(),
                    },
                );
            }
            None => {
                self.cache.remove(destination);
            }
        }
        Ok(())
    }

    /// Install a route candidate through `next_hop`
    pub async fn add_route(
        &self,
        destination: NodeId,
        next_hop: NodeId,
        hop_count: u8,
        path_quality: f64,
        path_nodes: Vec<NodeId>,
    ) -> Result<Route, RoutingError> {
        if hop_count == 0 {
            return Err(RoutingError::InvalidRoute("hop count must be at least 1".to_string()));
        }
        if destination == self.local_id || next_hop == self.local_id {
            return Err(RoutingError::InvalidRoute(format!(
                "route to {} via {} involves the local node",
                destination.short(),
                next_hop.short()
            )));
        }

        let route = Route::new(
            destination,
            next_hop,
            hop_count,
            path_quality,
            path_nodes,
            now_millis(),
            self.config.route_timeout(),
        );
        self.table.store().upsert(route.clone()).await?;
        self.refresh_cache(&destination).await?;

        debug!(
            "Route to {} via {} ({} hops, quality {:.3}, cost {:.3})",
            destination.short(),
            next_hop.short(),
            hop_count,
            route.path_quality,
            route.path_cost
        );
        self.events.notify(MeshEvent::RouteAdded {
            destination,
            next_hop,
            hop_count,
            path_cost: route.path_cost,
        });
        Ok(route)
    }

    /// Remove every candidate for `destination`, returning how many existed
    pub async fn remove_route(&self, destination: &NodeId) -> Result<usize, RoutingError> {
        let removed = self.table.store().remove_destination(destination).await?;
        self.cache.remove(destination);

        if removed > 0 {
            debug!("Removed {} routes to {}", removed, destination.short());
            self.events.notify(MeshEvent::RouteRemoved {
                destination: *destination,
            });
        }
        Ok(removed)
    }

    async fn broadcast(
        &self,
        message: &MeshMessage,
        exclude: &[NodeId],
    ) -> Result<usize, RoutingError> {
        let mut sent = 0;
        for connection in self.connections.get_connections().await? {
            let neighbor = connection.remote_id;
            if exclude.contains(&neighbor) {
                continue;
            }
            match self.connections.send_to(&neighbor, message).await {
                Ok(_) => sent += 1,
                Err(e) => debug!(
                    "Could not send {} to {}: {}",
                    message.kind(),
                    neighbor.short(),
                    e
                ),
            }
        }
        Ok(sent)
    }

    /// Flood a route request for `destination`, returning its request ID.
    ///
    /// While a discovery for the same destination is pending no new request
    /// is sent and the pending request's ID is returned.
    pub async fn discover_route(&self, destination: NodeId) -> Result<u64, RoutingError> {
        if destination == self.local_id {
            return Err(RoutingError::InvalidRoute("cannot discover the local node".to_string()));
        }

        let now = now_millis();
        let request_id = self.request_ids.next_id();
        match self.discovery.begin(destination, request_id, now) {
            Ok(None) => {}
            Ok(Some(replaced)) => {
                self.settle_expired(destination, replaced).await?;
            }
            Err(pending) => {
                debug!(
                    "Discovery for {} already pending (request {:016x})",
                    destination.short(),
                    pending.request_id
                );
                return Ok(pending.request_id);
            }
        }
        self.discovery.first_sighting(request_id, now);

        let rreq = RouteRequest::new(request_id, self.local_id, destination);
        let sent = self.broadcast(&MeshMessage::RouteRequest(rreq), &[]).await?;
        RouterCounters::bump(&self.counters.discoveries_started);

        info!(
            "Discovering route to {} (request {:016x}, {} neighbors)",
            destination.short(),
            request_id,
            sent
        );
        Ok(request_id)
    }

    /// Handle a route request received from neighbor `from`
    pub async fn handle_route_request(
        &self,
        rreq: RouteRequest,
        from: NodeId,
    ) -> Result<(), RoutingError> {
        if !self.discovery.first_sighting(rreq.request_id, now_millis()) {
            trace!("Ignoring duplicate request {:016x}", rreq.request_id);
            RouterCounters::bump(&self.counters.duplicate_requests);
            return Ok(());
        }
        if rreq.source_id == self.local_id {
            return Ok(());
        }

        let hops_to_source = rreq.hop_count.saturating_add(1);
        self.add_route(
            rreq.source_id,
            from,
            hops_to_source,
            self.config.reverse_route_quality,
            Vec::new(),
        )
        .await?;

        let destination = rreq.destination_id;
        let reply_hops = if destination == self.local_id {
            Some(1)
        } else if destination != from && self.connections.is_connected_to(&destination).await? {
            Some(2)
        } else {
            self.find_route(&destination)
                .await?
                .filter(|route| route.next_hop_id != from)
                .map(|route| route.hop_count.saturating_add(1))
        };

        if let Some(hop_count) = reply_hops {
            let rrep = RouteReply {
                request_id: rreq.request_id,
                destination_id: rreq.source_id,
                source_id: destination,
                replier_id: self.local_id,
                hop_count,
                timestamp: now_millis(),
            };
            debug!(
                "Answering request {:016x} for {} ({} hops)",
                rreq.request_id,
                destination.short(),
                hop_count
            );
            self.connections
                .send_to(&from, &MeshMessage::RouteReply(rrep))
                .await?;
            return Ok(());
        }

        if hops_to_source < self.config.max_hops {
            let forwarded = MeshMessage::RouteRequest(rreq.forwarded());
            let sent = self.broadcast(&forwarded, &[from, rreq.source_id]).await?;
            trace!("Re-broadcast request {:016x} to {} neighbors", rreq.request_id, sent);
        } else {
            debug!("Request {:016x} reached the hop limit", rreq.request_id);
        }
        Ok(())
    }

    /// Handle a route reply received from neighbor `from`
    pub async fn handle_route_reply(
        &self,
        rrep: RouteReply,
        from: NodeId,
    ) -> Result<(), RoutingError> {
        if rrep.source_id == self.local_id {
            return Ok(());
        }

        self.add_route(
            rrep.source_id,
            from,
            rrep.hop_count,
            self.config.reply_route_quality,
            Vec::new(),
        )
        .await?;
        self.events.notify(MeshEvent::RouteDiscovered {
            destination: rrep.source_id,
            next_hop: from,
            hop_count: rrep.hop_count,
            request_id: rrep.request_id,
        });

        if rrep.destination_id == self.local_id {
            if self.discovery.resolve(&rrep.source_id).is_some() {
                RouterCounters::bump(&self.counters.discoveries_resolved);
                info!(
                    "Discovered route to {} via {} ({} hops)",
                    rrep.source_id.short(),
                    from.short(),
                    rrep.hop_count
                );
            }
            return Ok(());
        }

        if rrep.hop_count >= self.config.max_hops {
            debug!("Reply {:016x} reached the hop limit", rrep.request_id);
            return Ok(());
        }

        match self.find_route(&rrep.destination_id).await? {
            Some(reverse) => {
                self.connections
                    .send_to(&reverse.next_hop_id, &MeshMessage::RouteReply(rrep.forwarded()))
                    .await?;
            }
            None => debug!(
                "No reverse route to {} for reply {:016x}",
                rrep.destination_id.short(),
                rrep.request_id
            ),
        }
        Ok(())
    }

    /// Refresh 1-hop routes to every neighbor and ask each for its table
    pub async fn update_routes(&self) -> Result<usize, RoutingError> {
        let neighbors = self.connections.get_connections().await?;
        for connection in &neighbors {
            let neighbor = connection.remote_id;
            self.add_route(neighbor, neighbor, 1, connection.quality_score, vec![neighbor])
                .await?;
            if let Err(e) = self.request_routes_from(&neighbor).await {
                debug!("Route table request to {} failed: {}", neighbor.short(), e);
            }
        }
        Ok(neighbors.len())
    }

    /// Ask `neighbor` for its routing table
    pub async fn request_routes_from(&self, neighbor: &NodeId) -> Result<(), RoutingError> {
        let request = MeshMessage::RouteTableRequest(RouteTableRequest::new(self.local_id));
        self.connections.send_to(neighbor, &request).await?;
        Ok(())
    }

    /// Answer a table request with the best routes not learned through the requester
    pub async fn handle_route_table_request(
        &self,
        request: RouteTableRequest,
        from: NodeId,
    ) -> Result<usize, RoutingError> {
        let entries: Vec<AdvertisedRoute> = self
            .table
            .get_all_best_routes()
            .await?
            .into_iter()
            .filter(|route| route.next_hop_id != from && route.destination_id != from)
            .map(|route| AdvertisedRoute {
                destination_id: route.destination_id,
                hop_count: route.hop_count,
                path_quality: route.path_quality,
            })
            .collect();
        let count = entries.len();

        trace!(
            "Advertising {} routes to {} (asked by {})",
            count,
            from.short(),
            request.requester_id.short()
        );
        let advert = MeshMessage::RouteTable(RouteTableAdvert::new(self.local_id, entries));
        self.connections.send_to(&from, &advert).await?;
        Ok(count)
    }

    /// Install routes advertised by neighbor `from`, returning how many were installed
    pub async fn handle_route_table(
        &self,
        advert: RouteTableAdvert,
        from: NodeId,
    ) -> Result<usize, RoutingError> {
        let mut installed = 0;
        for entry in advert.entries {
            if entry.destination_id == self.local_id || entry.destination_id == from {
                continue;
            }
            let hop_count = entry.hop_count.saturating_add(1);
            if hop_count > self.config.max_hops {
                continue;
            }
            self.add_route(
                entry.destination_id,
                from,
                hop_count,
                entry.path_quality * self.config.advertisement_discount,
                Vec::new(),
            )
            .await?;
            installed += 1;
        }
        trace!("Installed {} routes from {}", installed, from.short());
        Ok(installed)
    }

    /// Drop routes learned through a neighbor whose link closed
    pub async fn handle_connection_closed(&self, peer: &NodeId) -> Result<usize, RoutingError> {
        let routes = self.table.get_routes_through(peer).await?;
        let mut removed = 0;
        let mut touched = HashSet::new();
        for route in routes {
            if self
                .table
                .store()
                .remove_candidate(&route.destination_id, peer)
                .await?
            {
                removed += 1;
            }
            touched.insert(route.destination_id);
        }

        for destination in touched {
            self.refresh_cache(&destination).await?;
            if self.table.get_best_route(&destination).await?.is_none() {
                self.events.notify(MeshEvent::RouteRemoved { destination });
            }
        }

        if removed > 0 {
            info!("Dropped {} routes through {}", removed, peer.short());
        }
        Ok(removed)
    }

    /// Purge expired routes, flush the cache and age out discovery state
    pub async fn cleanup_expired_routes(&self) -> Result<CleanupReport, RoutingError> {
        let now = now_millis();
        let routes_purged = self.table.store().purge_expired(now).await?;
        self.cache.clear();
        let requests_forgotten = self.discovery.purge_seen(now);

        let mut discoveries_expired = 0;
        for (destination, pending) in self.discovery.expire(now) {
            if self.settle_expired(destination, pending).await? {
                discoveries_expired += 1;
            }
        }

        let report = CleanupReport {
            routes_purged,
            requests_forgotten,
            discoveries_expired,
        };
        debug!("Route cleanup: {:?}", report);
        Ok(report)
    }

    /// Close out a discovery that outlived the window, returning whether it
    /// failed. A destination that became reachable anyway counts as resolved.
    async fn settle_expired(
        &self,
        destination: NodeId,
        pending: PendingDiscovery,
    ) -> Result<bool, RoutingError> {
        if self.find_route(&destination).await?.is_some() {
            RouterCounters::bump(&self.counters.discoveries_resolved);
            debug!(
                "Discovery for {} timed out with a route in place (request {:016x})",
                destination.short(),
                pending.request_id
            );
            return Ok(false);
        }

        RouterCounters::bump(&self.counters.discoveries_expired);
        warn!(
            "Discovery for {} expired (request {:016x})",
            destination.short(),
            pending.request_id
        );
        self.events.notify(MeshEvent::DiscoveryFailed {
            destination,
            request_id: pending.request_id,
        });
        Ok(true)
    }

    /// Best route per destination
    pub async fn get_routing_table(&self) -> Result<Vec<Route>, RoutingError> {
        Ok(self.table.get_all_best_routes().await?)
    }

    /// Snapshot of route and traffic statistics
    pub async fn get_stats(&self) -> Result<RouterStats, RoutingError> {
        let routes = self.table.store().list(now_millis()).await?;
        let destinations: HashSet<NodeId> = routes.iter().map(|r| r.destination_id).collect();

        let mut stats = RouterStats::new(self.local_id);
        stats.total_routes = routes.len();
        stats.destinations = destinations.len();
        if !routes.is_empty() {
            let n = routes.len() as f64;
            stats.average_hop_count = routes.iter().map(|r| r.hop_count as f64).sum::<f64>() / n;
            stats.average_quality = routes.iter().map(|r| r.path_quality).sum::<f64>() / n;
        }
        stats.cached_routes = self.cache.len();
        stats.pending_discoveries = self.discovery.pending_count();
        self.counters.fill(&mut stats);
        Ok(stats)
    }

    /// Plan a path to `destination` over the links and routes known right now.
    ///
    /// Direct links are weighted by their live quality. Each best route is
    /// added as a virtual edge from its next hop to its destination, weighted
    /// by the route's path quality.
    pub async fn plan_path(
        &self,
        destination: &NodeId,
    ) -> Result<Option<OptimalPath>, RoutingError> {
        let qualities: LinkQualities = self
            .connections
            .get_connections()
            .await?
            .into_iter()
            .map(|c| (self.local_id, c.remote_id, c.quality_score))
            .collect();
        let mut graph = Graph::from_link_qualities(&qualities);

        for route in self.table.get_all_best_routes().await? {
            if route.next_hop_id != route.destination_id {
                graph.add_edge(
                    route.next_hop_id,
                    route.destination_id,
                    link_cost(route.path_quality),
                );
            }
        }

        Ok(self
            .optimizer
            .find_optimal_path(&self.local_id, destination, &graph))
    }

    /// Dispatch an inbound message from neighbor `from`
    pub async fn handle_message(
        self: &Arc<Self>,
        message: MeshMessage,
        from: NodeId,
    ) -> Result<(), RoutingError> {
        trace!("Handling {} from {}", message.kind(), from.short());
        match message {
            MeshMessage::Packet(packet) => self.route_packet(packet).await.map(|_| ()),
            MeshMessage::RouteRequest(rreq) => self.handle_route_request(rreq, from).await,
            MeshMessage::RouteReply(rrep) => self.handle_route_reply(rrep, from).await,
            MeshMessage::RouteTableRequest(request) => self
                .handle_route_table_request(request, from)
                .await
                .map(|_| ()),
            MeshMessage::RouteTable(advert) => {
                self.handle_route_table(advert, from).await.map(|_| ())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request_id::SequentialRequestIds;
    use mesh_identity::{Ed25519Verifier, NodeIdentity};
    use mesh_session::{ChannelHub, ConnectionConfig, Envelope, EventRecord};
    use mesh_storage::{MemoryConnectionStore, MemoryRouteStore, QualityMetrics};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::sync::{broadcast, mpsc};

    struct Harness {
        router: Arc<MeshRouter>,
        hub: ChannelHub,
        events: broadcast::Receiver<EventRecord>,
    }

    fn harness(config: RouterConfig) -> Harness {
        let identity = NodeIdentity::generate();
        let hub = ChannelHub::new();
        let (transport, _inbound) = hub.register(identity.node_id());
        let notifier = MeshEventNotifier::new(identity.node_id(), 256);
        let events = notifier.subscribe();
        let manager = ConnectionManager::new(
            identity,
            ConnectionConfig::default(),
            Arc::new(MemoryConnectionStore::new()),
            Arc::new(transport),
            Arc::new(Ed25519Verifier),
            notifier,
        );
        let router = MeshRouter::new(
            config,
            Arc::new(manager),
            RoutingTable::new(Arc::new(MemoryRouteStore::new())),
            Arc::new(SequentialRequestIds::starting_at(100)),
        );
        Harness {
            router: Arc::new(router),
            hub,
            events,
        }
    }

    fn metrics() -> QualityMetrics {
        QualityMetrics {
            latency_ms: 20.0,
            packet_loss: 0.0,
            bandwidth_up: 5_000_000,
            bandwidth_down: 5_000_000,
        }
    }

    fn node() -> NodeId {
        NodeIdentity::generate().node_id()
    }

    /// Register a neighbor on the hub and open a link to it
    async fn neighbor(h: &Harness) -> (NodeId, mpsc::UnboundedReceiver<Envelope>) {
        let peer = node();
        let (_transport, rx) = h.hub.register(peer);
        let manager = h.router.connections();
        let conn = manager.connect_to_peer(peer, BTreeMap::new()).await.unwrap();
        manager
            .mark_established(&conn.connection_id, metrics())
            .await
            .unwrap();
        (peer, rx)
    }

    fn drain_events(events: &mut broadcast::Receiver<EventRecord>) -> Vec<MeshEvent> {
        let mut out = Vec::new();
        while let Ok(record) = events.try_recv() {
            out.push(record.event);
        }
        out
    }

    #[tokio::test]
    async fn test_local_delivery() {
        let mut h = harness(RouterConfig::default());
        let local = h.router.local_id();
        let packet = DataPacket::new(node(), local, b"hi".to_vec());

        let decision = h.router.route_packet(packet).await.unwrap();
        assert_eq!(decision, RoutingDecision::Local);
        assert!(drain_events(&mut h.events)
            .iter()
            .any(|e| matches!(
                e,
                MeshEvent::PacketReceived { packet } if packet.payload.as_ref() == b"hi"
            )));
    }

    #[tokio::test]
    async fn test_hop_limit() {
        let h = harness(RouterConfig::default());
        let mut packet = DataPacket::new(node(), node(), b"x".to_vec());
        packet.hop_count = 10;

        let err = h.router.route_packet(packet).await.unwrap_err();
        assert!(matches!(err, RoutingError::HopLimitExceeded { hop_count: 10, max_hops: 10 }));

        let stats = h.router.get_stats().await.unwrap();
        assert_eq!(stats.packets_dropped, 1);
        assert_eq!(stats.drop_reasons["hop limit exceeded"], 1);
    }


    #[tokio::test]
    async fn test_hop_limit_applies_to_direct_neighbors() {
        let h = harness(RouterConfig::default());
        let (peer, mut rx) = neighbor(&h).await;
        let mut packet = DataPacket::new(node(), peer, b"x".to_vec());
        packet.hop_count = 10;

        let err = h.router.route_packet(packet).await.unwrap_err();
        assert!(matches!(
            err,
            RoutingError::HopLimitExceeded {
                hop_count: 10,
                max_hops: 10
            }
        ));
        assert!(rx.try_recv().is_err());
        assert_eq!(h.router.get_stats().await.unwrap().packets_dropped, 1);
    }

    #[tokio::test]
    async fn test_direct_send_stamps_packet() {
        let h = harness(RouterConfig::default());
        let (peer, mut rx) = neighbor(&h).await;

        let decision = h
            .router
            .route_packet(DataPacket::new(h.router.local_id(), peer, b"x".to_vec()))
            .await
            .unwrap();
        assert_eq!(decision, RoutingDecision::Direct(peer));

        let envelope = rx.try_recv().unwrap();
        match envelope.message {
            MeshMessage::Packet(p) => {
                assert_eq!(p.hop_count, 1);
                assert_eq!(p.path, vec![h.router.local_id()]);
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_forward_along_route() {
        let h = harness(RouterConfig::default());
        let (b, mut rx) = neighbor(&h).await;
        let c = node();
        h.router.add_route(c, b, 2, 0.9, vec![b, c]).await.unwrap();

        let decision = h
            .router
            .route_packet(DataPacket::new(h.router.local_id(), c, b"x".to_vec()))
            .await
            .unwrap();
        assert_eq!(decision, RoutingDecision::Forwarded(b));
        assert!(matches!(rx.try_recv().unwrap().message, MeshMessage::Packet(_)));
        assert_eq!(h.router.get_stats().await.unwrap().cached_routes, 1);
    }

    #[tokio::test]
    async fn test_unreachable_starts_discovery() {
        let h = harness(RouterConfig::default());
        let (_b, mut rx) = neighbor(&h).await;
        let target = node();

        let err = h
            .router
            .route_packet(DataPacket::new(h.router.local_id(), target, b"x".to_vec()))
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::UnreachableDestination(d) if d == target));

        let envelope = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match envelope.message {
            MeshMessage::RouteRequest(rreq) => {
                assert_eq!(rreq.destination_id, target);
                assert_eq!(rreq.hop_count, 0);
            }
            other => panic!("unexpected {}", other.kind()),
        }

        let stats = h.router.get_stats().await.unwrap();
        assert_eq!(stats.pending_discoveries, 1);
        assert_eq!(stats.drop_reasons["no route to destination"], 1);
    }

    #[tokio::test]
    async fn test_discovery_suppressed_while_pending() {
        let h = harness(RouterConfig::default());
        let (_b, mut rx) = neighbor(&h).await;
        let target = node();

        let first = h.router.discover_route(target).await.unwrap();
        let second = h.router.discover_route(target).await.unwrap();
        assert_eq!(first, second);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_add_route_validation() {
        let h = harness(RouterConfig::default());
        let local = h.router.local_id();
        let b = node();

        assert!(matches!(
            h.router.add_route(node(), b, 0, 0.9, vec![]).await,
            Err(RoutingError::InvalidRoute(_))
        ));
        assert!(matches!(
            h.router.add_route(local, b, 1, 0.9, vec![]).await,
            Err(RoutingError::InvalidRoute(_))
        ));

        let route = h.router.add_route(node(), b, 3, 1.5, vec![]).await.unwrap();
        assert_eq!(route.path_quality, 1.0);
        assert_eq!(route.path_cost, 0.0);
    }

    #[tokio::test]
    async fn test_request_for_self_is_answered() {
        let h = harness(RouterConfig::default());
        let (b, mut rx) = neighbor(&h).await;
        let origin = node();
        let rreq = RouteRequest::new(7, origin, h.router.local_id()).forwarded();

        h.router.handle_route_request(rreq, b).await.unwrap();

        let reverse = h.router.find_route(&origin).await.unwrap().unwrap();
        assert_eq!(reverse.next_hop_id, b);
        assert_eq!(reverse.hop_count, 2);
        assert_eq!(reverse.path_quality, 0.8);

        match rx.try_recv().unwrap().message {
            MeshMessage::RouteReply(rrep) => {
                assert_eq!(rrep.request_id, 7);
                assert_eq!(rrep.destination_id, origin);
                assert_eq!(rrep.source_id, h.router.local_id());
                assert_eq!(rrep.hop_count, 1);
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_duplicate_request_ignored() {
        let h = harness(RouterConfig::default());
        let (b, mut rx) = neighbor(&h).await;
        let rreq = RouteRequest::new(9, b, h.router.local_id());

        h.router.handle_route_request(rreq.clone(), b).await.unwrap();
        h.router.handle_route_request(rreq, b).await.unwrap();

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
        assert_eq!(h.router.get_stats().await.unwrap().duplicate_requests, 1);
    }


    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_duplicate_requests_answered_once() {
        let h = harness(RouterConfig::default());
        let (b, mut rx) = neighbor(&h).await;
        let rreq = RouteRequest::new(21, b, h.router.local_id());

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let router = Arc::clone(&h.router);
                let rreq = rreq.clone();
                tokio::spawn(async move { router.handle_route_request(rreq, b).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert!(matches!(rx.try_recv().unwrap().message, MeshMessage::RouteReply(_)));
        assert!(rx.try_recv().is_err());
        assert_eq!(h.router.get_stats().await.unwrap().duplicate_requests, 15);
    }

    #[tokio::test]
    async fn test_request_rebroadcast_excludes_sender() {
        let h = harness(RouterConfig::default());
        let (b, mut rx_b) = neighbor(&h).await;
        let (_c, mut rx_c) = neighbor(&h).await;
        let rreq = RouteRequest::new(11, node(), node());

        h.router.handle_route_request(rreq, b).await.unwrap();

        assert!(rx_b.try_recv().is_err());
        match rx_c.try_recv().unwrap().message {
            MeshMessage::RouteRequest(forwarded) => assert_eq!(forwarded.hop_count, 1),
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_request_at_hop_limit_not_rebroadcast() {
        let config = RouterConfig {
            max_hops: 2,
            ..Default::default()
        };
        let h = harness(config);
        let (b, _rx_b) = neighbor(&h).await;
        let (_c, mut rx_c) = neighbor(&h).await;
        let rreq = RouteRequest::new(12, node(), node()).forwarded();

        h.router.handle_route_request(rreq, b).await.unwrap();
        assert!(rx_c.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_neighbor_of_destination_answers() {
        let h = harness(RouterConfig::default());
        let (b, mut rx_b) = neighbor(&h).await;
        let (d, _rx_d) = neighbor(&h).await;

        h.router
            .handle_route_request(RouteRequest::new(13, b, d), b)
            .await
            .unwrap();

        match rx_b.try_recv().unwrap().message {
            MeshMessage::RouteReply(rrep) => {
                assert_eq!(rrep.source_id, d);
                assert_eq!(rrep.hop_count, 2);
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_reply_resolves_discovery() {
        let mut h = harness(RouterConfig::default());
        let (b, _rx) = neighbor(&h).await;
        let target = node();

        let request_id = h.router.discover_route(target).await.unwrap();
        let rrep = RouteReply {
            request_id,
            destination_id: h.router.local_id(),
            source_id: target,
            replier_id: target,
            hop_count: 2,
            timestamp: now_millis(),
        };
        h.router.handle_route_reply(rrep, b).await.unwrap();

        let route = h.router.find_route(&target).await.unwrap().unwrap();
        assert_eq!(route.next_hop_id, b);
        assert_eq!(route.hop_count, 2);
        assert_eq!(route.path_quality, 0.9);

        let stats = h.router.get_stats().await.unwrap();
        assert_eq!(stats.pending_discoveries, 0);
        assert_eq!(stats.discoveries_resolved, 1);
        assert!(drain_events(&mut h.events)
            .iter()
            .any(|e| matches!(
                e,
                MeshEvent::RouteDiscovered { destination, .. } if *destination == target
            )));
    }

    #[tokio::test]
    async fn test_reply_forwarded_along_reverse_route() {
        let h = harness(RouterConfig::default());
        let (b, mut rx_b) = neighbor(&h).await;
        let (c, _rx_c) = neighbor(&h).await;
        let origin = node();
        let target = node();
        h.router.add_route(origin, b, 2, 0.8, vec![]).await.unwrap();

        let rrep = RouteReply {
            request_id: 1,
            destination_id: origin,
            source_id: target,
            replier_id: target,
            hop_count: 1,
            timestamp: now_millis(),
        };
        h.router.handle_route_reply(rrep, c).await.unwrap();

        match rx_b.try_recv().unwrap().message {
            MeshMessage::RouteReply(forwarded) => assert_eq!(forwarded.hop_count, 2),
            other => panic!("unexpected {}", other.kind()),
        }
        assert_eq!(h.router.find_route(&target).await.unwrap().unwrap().next_hop_id, c);
    }

    #[tokio::test]
    async fn test_table_request_split_horizon() {
        let h = harness(RouterConfig::default());
        let (b, mut rx_b) = neighbor(&h).await;
        let (c, _rx_c) = neighbor(&h).await;
        let via_b = node();
        let via_c = node();
        h.router.add_route(via_b, b, 2, 0.9, vec![]).await.unwrap();
        h.router.add_route(via_c, c, 2, 0.9, vec![]).await.unwrap();
        h.router.add_route(c, c, 1, 1.0, vec![c]).await.unwrap();

        let count = h
            .router
            .handle_route_table_request(RouteTableRequest::new(b), b)
            .await
            .unwrap();
        assert_eq!(count, 2);

        match rx_b.try_recv().unwrap().message {
            MeshMessage::RouteTable(advert) => {
                assert_eq!(advert.advertiser_id, h.router.local_id());
                let dests: HashSet<NodeId> =
                    advert.entries.iter().map(|e| e.destination_id).collect();
                assert!(dests.contains(&via_c));
                assert!(dests.contains(&c));
                assert!(!dests.contains(&via_b));
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_route_table_install() {
        let h = harness(RouterConfig::default());
        let (b, _rx) = neighbor(&h).await;
        let good = node();
        let far = node();
        let entry = |destination_id, hop_count| AdvertisedRoute {
            destination_id,
            hop_count,
            path_quality: 0.5,
        };
        let advert = RouteTableAdvert::new(
            b,
            vec![
                entry(h.router.local_id(), 1),
                entry(b, 1),
                entry(far, 10),
                entry(good, 2),
            ],
        );

        assert_eq!(h.router.handle_route_table(advert, b).await.unwrap(), 1);
        let route = h.router.find_route(&good).await.unwrap().unwrap();
        assert_eq!(route.hop_count, 3);
        assert!((route.path_quality - 0.45).abs() < 1e-9);
        assert!(h.router.find_route(&far).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_routes_refreshes_neighbors() {
        let h = harness(RouterConfig::default());
        let (b, mut rx) = neighbor(&h).await;

        assert_eq!(h.router.update_routes().await.unwrap(), 1);
        let route = h.router.find_route(&b).await.unwrap().unwrap();
        assert_eq!(route.hop_count, 1);
        assert_eq!(route.next_hop_id, b);
        assert!(matches!(rx.try_recv().unwrap().message, MeshMessage::RouteTableRequest(_)));
    }

    #[tokio::test]
    async fn test_connection_closed_invalidates_routes() {
        let mut h = harness(RouterConfig::default());
        let (b, _rx_b) = neighbor(&h).await;
        let (c, _rx_c) = neighbor(&h).await;
        let only_b = node();
        let both = node();
        h.router.add_route(only_b, b, 2, 0.9, vec![]).await.unwrap();
        h.router.add_route(both, b, 2, 0.9, vec![]).await.unwrap();
        h.router.add_route(both, c, 3, 0.9, vec![]).await.unwrap();
        drain_events(&mut h.events);

        assert_eq!(h.router.handle_connection_closed(&b).await.unwrap(), 2);
        assert!(h.router.find_route(&only_b).await.unwrap().is_none());
        assert_eq!(h.router.find_route(&both).await.unwrap().unwrap().next_hop_id, c);

        let removed: Vec<NodeId> = drain_events(&mut h.events)
            .into_iter()
            .filter_map(|e| match e {
                MeshEvent::RouteRemoved { destination } => Some(destination),
                _ => None,
            })
            .collect();
        assert_eq!(removed, vec![only_b]);
    }

    #[tokio::test]
    async fn test_remove_route() {
        let h = harness(RouterConfig::default());
        let d = node();
        h.router.add_route(d, node(), 1, 0.9, vec![]).await.unwrap();
        h.router.add_route(d, node(), 2, 0.9, vec![]).await.unwrap();

        assert_eq!(h.router.remove_route(&d).await.unwrap(), 2);
        assert_eq!(h.router.remove_route(&d).await.unwrap(), 0);
        assert!(h.router.get_routing_table().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_installs_and_lookups() {
        let h = harness(RouterConfig::default());
        let via = node();
        let destinations: Vec<NodeId> = (0..64).map(|_| node()).collect();

        let tasks: Vec<_> = destinations
            .iter()
            .map(|&d| {
                let router = Arc::clone(&h.router);
                tokio::spawn(async move {
                    router.find_route(&d).await.unwrap();
                    router.add_route(d, via, 2, 0.9, vec![]).await.unwrap();
                    router.find_route(&d).await.unwrap()
                })
            })
            .collect();
        for task in tasks {
            let found = task.await.unwrap().unwrap();
            assert_eq!(found.next_hop_id, via);
        }

        assert_eq!(h.router.get_routing_table().await.unwrap().len(), 64);
        for d in &destinations {
            assert!(h.router.find_route(d).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_cleanup_expires_discoveries() {
        let config = RouterConfig {
            rreq_dedup_ttl_secs: 0,
            ..Default::default()
        };
        let mut h = harness(config);
        let target = node();
        let request_id = h.router.discover_route(target).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = h.router.cleanup_expired_routes().await.unwrap();
        assert_eq!(report.discoveries_expired, 1);
        assert_eq!(report.requests_forgotten, 1);
        assert!(drain_events(&mut h.events).iter().any(|e| matches!(
            e,
            MeshEvent::DiscoveryFailed { request_id: id, .. } if *id == request_id
        )));
        assert_eq!(h.router.get_stats().await.unwrap().discoveries_expired, 1);
    }


    #[tokio::test]
    async fn test_restarted_discovery_reports_stale_one() {
        let config = RouterConfig {
            rreq_dedup_ttl_secs: 0,
            ..Default::default()
        };
        let mut h = harness(config);
        let target = node();
        let first = h.router.discover_route(target).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = h.router.discover_route(target).await.unwrap();
        assert_ne!(first, second);
        let failed: Vec<u64> = drain_events(&mut h.events)
            .into_iter()
            .filter_map(|e| match e {
                MeshEvent::DiscoveryFailed {
                    destination,
                    request_id,
                } if destination == target => Some(request_id),
                _ => None,
            })
            .collect();
        assert_eq!(failed, vec![first]);

        let stats = h.router.get_stats().await.unwrap();
        assert_eq!(stats.discoveries_expired, 1);
        assert_eq!(stats.pending_discoveries, 1);
    }

    #[tokio::test]
    async fn test_expired_discovery_with_route_is_not_a_failure() {
        let config = RouterConfig {
            rreq_dedup_ttl_secs: 0,
            ..Default::default()
        };
        let mut h = harness(config);
        let target = node();
        h.router.discover_route(target).await.unwrap();
        h.router.add_route(target, node(), 2, 0.9, vec![]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let report = h.router.cleanup_expired_routes().await.unwrap();
        assert_eq!(report.discoveries_expired, 0);
        assert!(!drain_events(&mut h.events)
            .iter()
            .any(|e| matches!(e, MeshEvent::DiscoveryFailed { .. })));

        let stats = h.router.get_stats().await.unwrap();
        assert_eq!(stats.discoveries_expired, 0);
        assert_eq!(stats.discoveries_resolved, 1);
        assert_eq!(stats.pending_discoveries, 0);
    }

    #[tokio::test]
    async fn test_plan_path_through_route() {
        let h = harness(RouterConfig::default());
        let (b, _rx) = neighbor(&h).await;
        let c = node();
        h.router.add_route(c, b, 2, 0.9, vec![]).await.unwrap();

        let path = h.router.plan_path(&c).await.unwrap().unwrap();
        assert_eq!(path.nodes, vec![h.router.local_id(), b, c]);
        assert_eq!(path.next_hop(), Some(b));
        assert!(h.router.plan_path(&node()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats_averages() {
        let h = harness(RouterConfig::default());
        h.router.add_route(node(), node(), 1, 1.0, vec![]).await.unwrap();
        h.router.add_route(node(), node(), 3, 0.5, vec![]).await.unwrap();

        let stats = h.router.get_stats().await.unwrap();
        assert_eq!(stats.total_routes, 2);
        assert_eq!(stats.destinations, 2);
        assert!((stats.average_hop_count - 2.0).abs() < 1e-9);
        assert!((stats.average_quality - 0.75).abs() < 1e-9);
    }
}
