//! Routing decisions, drop reasons and router statistics

use dashmap::DashMap;
use mesh_wire::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Where a packet went
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingDecision {
    /// Delivered to this node
    Local,
    /// Sent straight to the destination over a direct link
    Direct(NodeId),
    /// Sent to this next hop along a learned route
    Forwarded(NodeId),
}

/// Reason for dropping a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DropReason {
    /// No link or route to the destination
    NoRoute,
    /// Hop limit reached
    HopLimitExceeded,
    /// The chosen link rejected the send
    SendFailed,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::NoRoute => write!(f, "no route to destination"),
            DropReason::HopLimitExceeded => write!(f, "hop limit exceeded"),
            DropReason::SendFailed => write!(f, "send failed"),
        }
    }
}

/// Router statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterStats {
    /// Local node ID
    pub local_id: NodeId,
    /// Unexpired route candidates
    pub total_routes: usize,
    /// Destinations with at least one candidate
    pub destinations: usize,
    /// Mean hop count over all candidates
    pub average_hop_count: f64,
    /// Mean path quality over all candidates
    pub average_quality: f64,
    /// Entries in the route cache
    pub cached_routes: usize,
    /// Packets delivered locally
    pub packets_local: u64,
    /// Packets sent over a direct link
    pub packets_direct: u64,
    /// Packets forwarded along a route
    pub packets_forwarded: u64,
    /// Packets dropped
    pub packets_dropped: u64,
    /// Breakdown of drop reasons
    pub drop_reasons: HashMap<String, u64>,
    /// Discoveries this node originated
    pub discoveries_started: u64,
    /// Discoveries answered by a reply
    pub discoveries_resolved: u64,
    /// Discoveries that timed out
    pub discoveries_expired: u64,
    /// Discoveries still waiting for a reply
    pub pending_discoveries: usize,
    /// Route requests ignored as duplicates
    pub duplicate_requests: u64,
}

/// Live counters behind [`RouterStats`]
#[derive(Debug, Default)]
pub(crate) struct RouterCounters {
    pub packets_local: AtomicU64,
    pub packets_direct: AtomicU64,
    pub packets_forwarded: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub drop_reasons: DashMap<DropReason, u64>,
    pub discoveries_started: AtomicU64,
    pub discoveries_resolved: AtomicU64,
    pub discoveries_expired: AtomicU64,
    pub duplicate_requests: AtomicU64,
}

impl RouterCounters {
    pub fn record(&self, decision: &RoutingDecision) {
        let counter = match decision {
            RoutingDecision::Local => &self.packets_local,
            RoutingDecision::Direct(_) => &self.packets_direct,
            RoutingDecision::Forwarded(_) => &self.packets_forwarded,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self, reason: DropReason) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
        *self.drop_reasons.entry(reason).or_insert(0) += 1;
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Fill the counter fields of a stats snapshot
    pub fn fill(&self, stats: &mut RouterStats) {
        stats.packets_local = self.packets_local.load(Ordering::Relaxed);
        stats.packets_direct = self.packets_direct.load(Ordering::Relaxed);
        stats.packets_forwarded = self.packets_forwarded.load(Ordering::Relaxed);
        stats.packets_dropped = self.packets_dropped.load(Ordering::Relaxed);
        stats.drop_reasons = self
            .drop_reasons
            .iter()
            .map(|e| (e.key().to_string(), *e.value()))
            .collect();
        stats.discoveries_started = self.discoveries_started.load(Ordering::Relaxed);
        stats.discoveries_resolved = self.discoveries_resolved.load(Ordering::Relaxed);
        stats.discoveries_expired = self.discoveries_expired.load(Ordering::Relaxed);
        stats.duplicate_requests = self.duplicate_requests.load(Ordering::Relaxed);
    }
}

impl RouterStats {
    /// Empty statistics for a node
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            total_routes: 0,
            destinations: 0,
            average_hop_count: 0.0,
            average_quality: 0.0,
            cached_routes: 0,
            packets_local: 0,
            packets_direct: 0,
            packets_forwarded: 0,
            packets_dropped: 0,
            drop_reasons: HashMap::new(),
            discoveries_started: 0,
            discoveries_resolved: 0,
            discoveries_expired: 0,
            pending_discoveries: 0,
            duplicate_requests: 0,
        }
    }
}
