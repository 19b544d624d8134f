//! Router configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Discovery limits, lifetimes and route-quality heuristics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Packets and requests at this hop count are dropped
    pub max_hops: u8,
    /// Lifetime of an installed route
    pub route_timeout_secs: u64,
    /// How long a request ID is remembered, and how long a discovery may stay pending
    pub rreq_dedup_ttl_secs: u64,
    /// Lifetime of a route cache entry
    pub route_cache_ttl_secs: u64,
    /// Quality given to reverse routes learned from requests
    pub reverse_route_quality: f64,
    /// Quality given to routes learned from replies
    pub reply_route_quality: f64,
    /// Factor applied to qualities learned from neighbor tables
    pub advertisement_discount: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_hops: 10,
            route_timeout_secs: 300,
            rreq_dedup_ttl_secs: 60,
            route_cache_ttl_secs: 60,
            reverse_route_quality: 0.8,
            reply_route_quality: 0.9,
            advertisement_discount: 0.9,
        }
    }
}

impl RouterConfig {
    /// Route lifetime
    pub fn route_timeout(&self) -> Duration {
        Duration::from_secs(self.route_timeout_secs)
    }

    /// Request dedup window
    pub fn rreq_dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.rreq_dedup_ttl_secs)
    }

    /// Cache entry lifetime
    pub fn route_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.route_cache_ttl_secs)
    }
}
