//! Cost graphs and per-link quality maps.

use mesh_wire::NodeId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Quality assumed for a link with no measurement
pub const DEFAULT_LINK_QUALITY: f64 = 0.5;

/// Floor applied before taking the logarithm in [`link_cost`]
pub const MIN_LINK_QUALITY: f64 = 1e-6;

/// Edge cost for a link of the given quality.
///
/// Costs add along a path while qualities multiply, so the cheapest path
/// under this cost is the highest-quality one.
pub fn link_cost(quality: f64) -> f64 {
    let quality = if quality.is_nan() {
        MIN_LINK_QUALITY
    } else {
        quality.clamp(MIN_LINK_QUALITY, 1.0)
    };
    -quality.ln()
}

/// Undirected per-link qualities
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LinkQualities {
    links: HashMap<(NodeId, NodeId), f64>,
}

impl LinkQualities {
    /// Empty map
    pub fn new() -> Self {
        Self::default()
    }

    fn key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Set the quality of the link between `a` and `b`
    pub fn set(&mut self, a: NodeId, b: NodeId, quality: f64) {
        self.links.insert(Self::key(a, b), quality);
    }

    /// Measured quality of the link, if any
    pub fn get(&self, a: &NodeId, b: &NodeId) -> Option<f64> {
        self.links.get(&Self::key(*a, *b)).copied()
    }

    /// Iterate over `(a, b, quality)` with `a <= b`
    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &NodeId, f64)> {
        self.links.iter().map(|((a, b), q)| (a, b, *q))
    }

    /// Number of links
    pub fn len(&self) -> usize {
        self.links.len()
    }

    /// Whether no link is known
    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

impl FromIterator<(NodeId, NodeId, f64)> for LinkQualities {
    fn from_iter<T: IntoIterator<Item = (NodeId, NodeId, f64)>>(iter: T) -> Self {
        let mut qualities = Self::new();
        for (a, b, q) in iter {
            qualities.set(a, b, q);
        }
        qualities
    }
}

/// Directed adjacency map: node -> neighbor -> non-negative edge cost
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    adjacency: HashMap<NodeId, HashMap<NodeId, f64>>,
}

impl Graph {
    /// Empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a directed edge
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, cost: f64) {
        self.adjacency.entry(from).or_default().insert(to, cost);
        self.adjacency.entry(to).or_default();
    }

    /// Build a symmetric cost graph, one edge pair per link, weighted by [`link_cost`]
    pub fn from_link_qualities(qualities: &LinkQualities) -> Self {
        let mut graph = Self::new();
        for (a, b, quality) in qualities.iter() {
            let cost = link_cost(quality);
            graph.add_edge(*a, *b, cost);
            graph.add_edge(*b, *a, cost);
        }
        graph
    }

    /// Outgoing edges of a node
    pub fn neighbors(&self, node: &NodeId) -> Option<&HashMap<NodeId, f64>> {
        self.adjacency.get(node)
    }

    /// Whether the node appears in the graph
    pub fn contains(&self, node: &NodeId) -> bool {
        self.adjacency.contains_key(node)
    }

    /// Number of nodes
    pub fn node_count(&self) -> usize {
        self.adjacency.len()
    }
}

impl From<HashMap<NodeId, HashMap<NodeId, f64>>> for Graph {
    fn from(adjacency: HashMap<NodeId, HashMap<NodeId, f64>>) -> Self {
        Self { adjacency }
    }
}
