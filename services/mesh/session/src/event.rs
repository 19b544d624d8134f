//! Event notification for mesh state changes

use mesh_wire::{now_millis, ConnectionId, DataPacket, NodeId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, trace};

/// Why a link was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CloseReason {
    /// Caller asked for it
    Requested,
    /// Node is shutting down
    Shutdown,
    /// Connected link idle past the health-check limit
    Timeout,
    /// Quality score under the threshold
    PoorQuality,
    /// Any link idle past the cleanup limit
    Stale,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => write!(f, "requested"),
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::Timeout => write!(f, "timeout"),
            CloseReason::PoorQuality => write!(f, "poor_quality"),
            CloseReason::Stale => write!(f, "stale"),
        }
    }
}

/// State change observed by a node
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// Transport confirmed a link
    ConnectionEstablished {
        /// Link
        connection_id: ConnectionId,
        /// Peer
        peer: NodeId,
        /// Initial quality
        quality_score: f64,
    },
    /// A link is about to be deleted
    ConnectionClosing {
        /// Link
        connection_id: ConnectionId,
        /// Peer
        peer: NodeId,
        /// Why
        reason: CloseReason,
    },
    /// A link was deleted
    ConnectionClosed {
        /// Link
        connection_id: ConnectionId,
        /// Peer
        peer: NodeId,
        /// Why
        reason: CloseReason,
    },
    /// A route candidate was installed
    RouteAdded {
        /// Destination
        destination: NodeId,
        /// Next hop
        next_hop: NodeId,
        /// Hops to the destination
        hop_count: u8,
        /// Ranking cost
        path_cost: f64,
    },
    /// Every route to a destination was removed
    RouteRemoved {
        /// Destination
        destination: NodeId,
    },
    /// A route reply installed a route
    RouteDiscovered {
        /// Destination
        destination: NodeId,
        /// Next hop
        next_hop: NodeId,
        /// Hops to the destination
        hop_count: u8,
        /// Request that produced the reply
        request_id: u64,
    },
    /// Connected link count is under the minimum
    NeedMorePeers {
        /// Connected links right now
        connected: usize,
        /// Links missing to reach the minimum
        deficit: usize,
    },
    /// A packet addressed to this node arrived
    PacketReceived {
        /// The packet
        packet: DataPacket,
    },
    /// A discovery expired without a route
    DiscoveryFailed {
        /// Destination searched for
        destination: NodeId,
        /// Request that timed out
        request_id: u64,
    },
}

impl MeshEvent {
    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            MeshEvent::ConnectionEstablished { .. } => "connection_established",
            MeshEvent::ConnectionClosing { .. } => "connection_closing",
            MeshEvent::ConnectionClosed { .. } => "connection_closed",
            MeshEvent::RouteAdded { .. } => "route_added",
            MeshEvent::RouteRemoved { .. } => "route_removed",
            MeshEvent::RouteDiscovered { .. } => "route_discovered",
            MeshEvent::NeedMorePeers { .. } => "need_more_peers",
            MeshEvent::PacketReceived { .. } => "packet_received",
            MeshEvent::DiscoveryFailed { .. } => "discovery_failed",
        }
    }
}

/// An event with its delivery metadata
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    /// Node that emitted the event
    pub originator: NodeId,
    /// Per-notifier sequence number, starting at 1
    pub sequence: u64,
    /// Emission time (Unix millis)
    pub timestamp: u64,
    /// The event
    pub event: MeshEvent,
}

/// Broadcasts [`MeshEvent`]s to any number of subscribers.
///
/// Cloning shares the channel and the sequence counter. Events emitted while
/// nobody is subscribed are dropped; slow subscribers see `Lagged`.
#[derive(Debug, Clone)]
pub struct MeshEventNotifier {
    local_id: NodeId,
    event_tx: broadcast::Sender<EventRecord>,
    sequence_counter: Arc<AtomicU64>,
}

impl MeshEventNotifier {
    /// Create a notifier buffering up to `capacity` events per subscriber
    pub fn new(local_id: NodeId, capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            local_id,
            event_tx,
            sequence_counter: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<EventRecord> {
        self.event_tx.subscribe()
    }

    /// Emit an event
    pub fn notify(&self, event: MeshEvent) {
        let record = EventRecord {
            originator: self.local_id,
            sequence: self.sequence_counter.fetch_add(1, Ordering::SeqCst),
            timestamp: now_millis(),
            event,
        };
        let kind = record.event.kind();
        let sequence = record.sequence;

        match self.event_tx.send(record) {
            Ok(receivers) => debug!(
                "Sent mesh event {} (seq: {}) to {} subscribers",
                kind, sequence, receivers
            ),
            Err(_) => trace!("Dropped mesh event {} (seq: {}): no subscribers", kind, sequence),
        }
    }
}
