//! Connection manager configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Limits and thresholds for direct links
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Upper bound on connected links
    pub max_connections: usize,
    /// Below this many connected links a `NeedMorePeers` event is emitted
    pub min_connections: usize,
    /// Connected links idle longer than this are closed by the health check
    pub stale_connection_timeout_secs: u64,
    /// Links in any state idle longer than this are closed by the cleanup sweep
    pub cleanup_stale_timeout_secs: u64,
    /// Connected links scoring below this are closed by the health check
    pub poor_quality_threshold: f64,
    /// Packet loss added to a link each time a send over it fails
    pub send_failure_loss_penalty: f64,
    /// Capacity of the event broadcast channel
    pub event_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: 50,
            min_connections: 3,
            stale_connection_timeout_secs: 300,
            cleanup_stale_timeout_secs: 600,
            poor_quality_threshold: 0.2,
            send_failure_loss_penalty: 0.1,
            event_capacity: 1024,
        }
    }
}

impl ConnectionConfig {
    /// Health-check idle limit
    pub fn stale_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.stale_connection_timeout_secs)
    }

    /// Cleanup-sweep idle limit
    pub fn cleanup_stale_timeout(&self) -> Duration {
        Duration::from_secs(self.cleanup_stale_timeout_secs)
    }
}
