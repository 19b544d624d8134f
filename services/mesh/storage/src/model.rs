//! Persisted connection and route records.

use mesh_wire::{ConnectionId, NodeId};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Lifecycle state of a direct link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Handshake in progress, transport not yet confirmed
    Connecting,
    /// Transport confirmed the link
    Connected,
    /// Close in progress; the record is deleted right after
    Closing,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Closing => write!(f, "closing"),
        }
    }
}

/// Link measurements reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityMetrics {
    /// Round-trip latency in milliseconds
    pub latency_ms: f64,
    /// Fraction of packets lost, in [0, 1]
    pub packet_loss: f64,
    /// Upstream bandwidth in bits per second
    pub bandwidth_up: u64,
    /// Downstream bandwidth in bits per second
    pub bandwidth_down: u64,
}

/// A direct link to one peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    /// Symmetric link identifier
    pub connection_id: ConnectionId,
    /// This node
    pub local_id: NodeId,
    /// The peer
    pub remote_id: NodeId,
    /// Lifecycle state
    pub state: ConnectionState,
    /// Link quality in [0, 1]
    pub quality_score: f64,
    /// Latest metrics snapshot
    pub metrics: QualityMetrics,
    /// Bytes sent over the link
    pub bytes_sent: u64,
    /// Bytes received over the link
    pub bytes_received: u64,
    /// Caller-supplied peer metadata
    pub peer_info: BTreeMap<String, String>,
    /// Creation time (Unix millis)
    pub created_at: u64,
    /// Time the transport confirmed the link (Unix millis)
    pub established_at: Option<u64>,
    /// Last traffic or quality update (Unix millis)
    pub last_activity: u64,
}

impl Connection {
    /// Create a record in the `Connecting` state
    pub fn connecting(
        local_id: NodeId,
        remote_id: NodeId,
        peer_info: BTreeMap<String, String>,
        now: u64,
    ) -> Self {
        Self {
            connection_id: ConnectionId::between(&local_id, &remote_id),
            local_id,
            remote_id,
            state: ConnectionState::Connecting,
            quality_score: 0.0,
            metrics: QualityMetrics::default(),
            bytes_sent: 0,
            bytes_received: 0,
            peer_info,
            created_at: now,
            established_at: None,
            last_activity: now,
        }
    }

    /// Whether the transport has confirmed the link
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Time since the last activity
    pub fn idle_for(&self, now: u64) -> Duration {
        Duration::from_millis(now.saturating_sub(self.last_activity))
    }
}

/// A learned path to a destination through one next hop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    /// Destination node
    pub destination_id: NodeId,
    /// Neighbor to forward through
    pub next_hop_id: NodeId,
    /// Links to the destination, at least 1
    pub hop_count: u8,
    /// Product of link qualities along the path, in [0, 1]
    pub path_quality: f64,
    /// `hop_count * (1 - path_quality)`, lower is better
    pub path_cost: f64,
    /// Nodes along the path, when known
    pub path_nodes: Vec<NodeId>,
    /// Creation time (Unix millis)
    pub created_at: u64,
    /// Expiry time (Unix millis)
    pub expires_at: u64,
}

impl Route {
    /// Build a route valid for `ttl` from `now`
    pub fn new(
        destination_id: NodeId,
        next_hop_id: NodeId,
        hop_count: u8,
        path_quality: f64,
        path_nodes: Vec<NodeId>,
        now: u64,
        ttl: Duration,
    ) -> Self {
        let path_quality = clamp_quality(path_quality);
        Self {
            destination_id,
            next_hop_id,
            hop_count,
            path_quality,
            path_cost: Self::cost(hop_count, path_quality),
            path_nodes,
            created_at: now,
            expires_at: now.saturating_add(ttl.as_millis() as u64),
        }
    }

    /// Ranking cost for a path
    pub fn cost(hop_count: u8, path_quality: f64) -> f64 {
        hop_count as f64 * (1.0 - clamp_quality(path_quality))
    }

    /// Whether the route has expired at `now`
    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at < now
    }

    /// Preference order: lower cost first, then higher quality
    pub fn rank(a: &Route, b: &Route) -> Ordering {
        a.path_cost
            .total_cmp(&b.path_cost)
            .then_with(|| b.path_quality.total_cmp(&a.path_quality))
    }
}

fn clamp_quality(quality: f64) -> f64 {
    if quality.is_nan() {
        0.0
    } else {
        quality.clamp(0.0, 1.0)
    }
}
