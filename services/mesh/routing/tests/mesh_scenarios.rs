//! Multi-node scenarios over the in-process channel transport.

use mesh_identity::{Ed25519Verifier, NodeIdentity};
use mesh_routing::{
    MeshNode, MeshRouter, RouterConfig, RoutingDecision, RoutingError, RoutingTable,
    ScheduleConfig, SequentialRequestIds,
};
use mesh_session::{
    establish_link, ChannelHub, ConnectionConfig, ConnectionManager, EventRecord, MeshEvent,
    MeshEventNotifier, Transport,
};
use mesh_storage::{MemoryConnectionStore, MemoryRouteStore, QualityMetrics, Route};
use mesh_wire::{DataPacket, MeshMessage, NodeId, RouteRequest};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const WAIT: Duration = Duration::from_secs(2);

fn metrics() -> QualityMetrics {
    QualityMetrics {
        latency_ms: 20.0,
        packet_loss: 0.0,
        bandwidth_up: 5_000_000,
        bandwidth_down: 5_000_000,
    }
}

fn spawn_node(hub: &ChannelHub, config: RouterConfig, id_base: u64) -> MeshNode {
    let identity = NodeIdentity::generate();
    let node_id = identity.node_id();
    let (transport, inbound) = hub.register(node_id);
    let manager = ConnectionManager::new(
        identity,
        ConnectionConfig::default(),
        Arc::new(MemoryConnectionStore::new()),
        Arc::new(transport),
        Arc::new(Ed25519Verifier),
        MeshEventNotifier::new(node_id, 1024),
    );
    let router = MeshRouter::new(
        config,
        Arc::new(manager),
        RoutingTable::new(Arc::new(MemoryRouteStore::new())),
        Arc::new(SequentialRequestIds::starting_at(id_base)),
    );
    let mut node = MeshNode::new(Arc::new(router), ScheduleConfig::default());
    node.start(inbound);
    node
}

/// Nodes linked in a line, each to the next
async fn chain(hub: &ChannelHub, len: usize, config: RouterConfig) -> Vec<MeshNode> {
    let nodes: Vec<MeshNode> = (0..len)
        .map(|i| spawn_node(hub, config.clone(), (i as u64 + 1) * 1_000))
        .collect();
    for pair in nodes.windows(2) {
        establish_link(pair[0].connections(), pair[1].connections(), metrics())
            .await
            .unwrap();
    }
    nodes
}

fn id(node: &MeshNode) -> NodeId {
    node.router().local_id()
}

async fn wait_for_route(node: &MeshNode, destination: &NodeId) -> Option<Route> {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        if let Some(route) = node.router().find_route(destination).await.unwrap() {
            return Some(route);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn wait_for_event<F>(
    events: &mut broadcast::Receiver<EventRecord>,
    mut pred: F,
) -> Option<MeshEvent>
where
    F: FnMut(&MeshEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(record) if pred(&record.event) => return Some(record.event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

async fn shutdown_all(nodes: Vec<MeshNode>) {
    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_chain_discovery_yields_two_hop_route() {
    let hub = ChannelHub::new();
    let nodes = chain(&hub, 3, RouterConfig::default()).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    let err = a
        .router()
        .route_packet(DataPacket::new(id(a), id(c), b"ping".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, RoutingError::UnreachableDestination(_)));

    let route = wait_for_route(a, &id(c)).await.expect("route to C");
    assert_eq!(route.next_hop_id, id(b));
    assert_eq!(route.hop_count, 2);

    // B learned the way back to A from the request
    let reverse = b.router().find_route(&id(a)).await.unwrap().unwrap();
    assert_eq!(reverse.next_hop_id, id(a));
    assert_eq!(reverse.hop_count, 1);

    let stats = a.router().get_stats().await.unwrap();
    assert_eq!(stats.discoveries_started, 1);
    assert_eq!(stats.discoveries_resolved, 1);
    assert_eq!(stats.pending_discoveries, 0);

    shutdown_all(nodes).await;
}

#[tokio::test]
async fn test_packet_delivered_end_to_end() {
    let hub = ChannelHub::new();
    let nodes = chain(&hub, 3, RouterConfig::default()).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    let mut c_events = c.connections().events().subscribe();

    a.router().discover_route(id(c)).await.unwrap();
    wait_for_route(a, &id(c)).await.expect("route to C");

    let decision = a
        .router()
        .route_packet(DataPacket::new(id(a), id(c), b"hello".to_vec()))
        .await
        .unwrap();
    assert_eq!(decision, RoutingDecision::Forwarded(id(b)));

    let event = wait_for_event(&mut c_events, |e| matches!(e, MeshEvent::PacketReceived { .. }))
        .await
        .expect("packet at C");
    match event {
        MeshEvent::PacketReceived { packet } => {
            assert_eq!(packet.source_id, id(a));
            assert_eq!(packet.hop_count, 2);
            assert_eq!(packet.path, vec![id(a), id(b)]);
            assert_eq!(packet.payload.as_ref(), b"hello");
        }
        other => panic!("unexpected {}", other.kind()),
    }

    shutdown_all(nodes).await;
}

#[tokio::test]
async fn test_longer_chain_counts_hops() {
    let hub = ChannelHub::new();
    let nodes = chain(&hub, 4, RouterConfig::default()).await;

    nodes[0].router().discover_route(id(&nodes[3])).await.unwrap();
    let route = wait_for_route(&nodes[0], &id(&nodes[3])).await.expect("route to D");
    assert_eq!(route.hop_count, 3);
    assert_eq!(route.next_hop_id, id(&nodes[1]));

    shutdown_all(nodes).await;
}

#[tokio::test]
async fn test_hop_limit_stops_discovery() {
    let hub = ChannelHub::new();
    let config = RouterConfig {
        max_hops: 2,
        ..Default::default()
    };
    let nodes = chain(&hub, 4, config).await;

    nodes[0].router().discover_route(id(&nodes[3])).await.unwrap();
    assert!(wait_for_route(&nodes[0], &id(&nodes[3])).await.is_none());

    shutdown_all(nodes).await;
}

#[tokio::test]
async fn test_duplicate_request_answered_once() {
    let hub = ChannelHub::new();
    let node = spawn_node(&hub, RouterConfig::default(), 1);
    let target = id(&node);

    // A bare endpoint standing in for a neighbor
    let bare = NodeIdentity::generate().node_id();
    let (bare_transport, mut bare_rx) = hub.register(bare);
    let conn = node
        .connections()
        .connect_to_peer(bare, BTreeMap::new())
        .await
        .unwrap();
    node.connections()
        .mark_established(&conn.connection_id, metrics())
        .await
        .unwrap();

    let rreq = MeshMessage::RouteRequest(RouteRequest::new(42, bare, target));
    bare_transport.send(&target, &rreq).await.unwrap();
    bare_transport.send(&target, &rreq).await.unwrap();

    let first = tokio::time::timeout(WAIT, bare_rx.recv()).await.unwrap().unwrap();
    assert!(matches!(
        first.message,
        MeshMessage::RouteReply(ref r) if r.request_id == 42 && r.hop_count == 1
    ));
    assert!(tokio::time::timeout(Duration::from_millis(200), bare_rx.recv())
        .await
        .is_err());

    let routes = node.router().table().get_all_routes(&bare).await.unwrap();
    assert_eq!(routes.len(), 1);
    assert_eq!(node.router().get_stats().await.unwrap().duplicate_requests, 1);

    node.shutdown().await;
}

#[tokio::test]
async fn test_table_exchange_fills_routes() {
    let hub = ChannelHub::new();
    let nodes = chain(&hub, 3, RouterConfig::default()).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);

    // B learns its neighbors first, then A asks B
    b.router().update_routes().await.unwrap();
    a.router().update_routes().await.unwrap();

    let route = wait_for_route(a, &id(c)).await.expect("route to C");
    assert_eq!(route.next_hop_id, id(b));
    assert_eq!(route.hop_count, 2);
    assert!((route.path_quality - 0.9).abs() < 1e-9);

    shutdown_all(nodes).await;
}

#[tokio::test]
async fn test_closed_link_drops_routes() {
    let hub = ChannelHub::new();
    let nodes = chain(&hub, 3, RouterConfig::default()).await;
    let (a, b, c) = (&nodes[0], &nodes[1], &nodes[2]);
    let mut a_events = a.connections().events().subscribe();

    a.router().discover_route(id(c)).await.unwrap();
    wait_for_route(a, &id(c)).await.expect("route to C");

    let link = a.connections().get_connection_to(&id(b)).await.unwrap().unwrap();
    a.connections()
        .close_connection(&link.connection_id, mesh_session::CloseReason::Requested)
        .await
        .unwrap();

    let c_id = id(c);
    wait_for_event(&mut a_events, |e| {
        matches!(e, MeshEvent::RouteRemoved { destination } if *destination == c_id)
    })
    .await
    .expect("route removal");
    assert!(a.router().find_route(&c_id).await.unwrap().is_none());
    assert!(a.router().table().get_routes_through(&id(b)).await.unwrap().is_empty());

    shutdown_all(nodes).await;
}
