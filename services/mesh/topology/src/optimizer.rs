//! Shortest path and path-quality scoring.

use crate::graph::{Graph, LinkQualities, DEFAULT_LINK_QUALITY};
use mesh_wire::NodeId;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use tracing::trace;

/// A complete path from source to destination
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimalPath {
    /// Nodes from source to destination, both included
    pub nodes: Vec<NodeId>,
    /// Sum of edge costs along the path
    pub total_cost: f64,
}

impl OptimalPath {
    /// Number of edges
    pub fn hop_count(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }

    /// First node after the source, if any
    pub fn next_hop(&self) -> Option<NodeId> {
        self.nodes.get(1).copied()
    }
}

/// Heap key ordering f64 costs totally
#[derive(Debug, Clone, Copy, PartialEq)]
struct Cost(f64);

impl Eq for Cost {}

impl PartialOrd for Cost {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cost {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Stateless path planner over explicit graph snapshots
#[derive(Debug, Clone, Copy, Default)]
pub struct PathOptimizer;

impl PathOptimizer {
    /// Create a planner
    pub fn new() -> Self {
        Self
    }

    /// Product of link qualities along consecutive node pairs.
    ///
    /// A path with fewer than two nodes has no edges and scores 1.0. Links
    /// with no measurement count as [`DEFAULT_LINK_QUALITY`].
    pub fn calculate_path_quality(
        &self,
        path_nodes: &[NodeId],
        link_qualities: &LinkQualities,
    ) -> f64 {
        path_nodes
            .windows(2)
            .map(|pair| {
                link_qualities
                    .get(&pair[0], &pair[1])
                    .unwrap_or(DEFAULT_LINK_QUALITY)
            })
            .product()
    }

    /// Dijkstra from `source`, stopping once `destination` is settled.
    ///
    /// Returns `None` when no path exists. Edge costs must be non-negative.
    pub fn find_optimal_path(
        &self,
        source: &NodeId,
        destination: &NodeId,
        graph: &Graph,
    ) -> Option<OptimalPath> {
        if source == destination {
            return Some(OptimalPath {
                nodes: vec![*source],
                total_cost: 0.0,
            });
        }

        let mut distances: HashMap<NodeId, f64> = HashMap::new();
        let mut previous: HashMap<NodeId, NodeId> = HashMap::new();
        let mut frontier: BinaryHeap<Reverse<(Cost, NodeId)>> = BinaryHeap::new();

        distances.insert(*source, 0.0);
        frontier.push(Reverse((Cost(0.0), *source)));

        while let Some(Reverse((Cost(current_dist), current))) = frontier.pop() {
            if current == *destination {
                let nodes = Self::reconstruct(source, destination, &previous)?;
                trace!(
                    "Planned {} -> {} over {} hops, cost {:.4}",
                    source.short(),
                    destination.short(),
                    nodes.len() - 1,
                    current_dist
                );
                return Some(OptimalPath {
                    nodes,
                    total_cost: current_dist,
                });
            }

            // Stale heap entry
            if current_dist > distances.get(&current).copied().unwrap_or(f64::INFINITY) {
                continue;
            }

            let Some(neighbors) = graph.neighbors(&current) else {
                continue;
            };
            for (&neighbor, &edge_cost) in neighbors {
                let new_dist = current_dist + edge_cost.max(0.0);
                let existing = distances.get(&neighbor).copied().unwrap_or(f64::INFINITY);
                if new_dist < existing {
                    distances.insert(neighbor, new_dist);
                    previous.insert(neighbor, current);
                    frontier.push(Reverse((Cost(new_dist), neighbor)));
                }
            }
        }

        trace!("No path {} -> {}", source.short(), destination.short());
        None
    }

    fn reconstruct(
        source: &NodeId,
        destination: &NodeId,
        previous: &HashMap<NodeId, NodeId>,
    ) -> Option<Vec<NodeId>> {
        let mut nodes = vec![*destination];
        let mut cursor = *destination;
        while cursor != *source {
            cursor = *previous.get(&cursor)?;
            nodes.push(cursor);
        }
        nodes.reverse();
        Some(nodes)
    }
}
