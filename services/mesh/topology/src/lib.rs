//! Quality-weighted path planning over mesh graph snapshots.
//!
//! Everything here is pure: callers hand in a [`Graph`] (or per-link
//! qualities) captured from live state, and get back a path and its cost.
//! Nothing in this crate observes connections or routes directly.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod graph;
pub mod optimizer;

pub use graph::{link_cost, Graph, LinkQualities, DEFAULT_LINK_QUALITY, MIN_LINK_QUALITY};
pub use optimizer::{OptimalPath, PathOptimizer};
