//! Configuration handling for the mesh node.
//!
//! Settings are read from a YAML file, then overridden by `MESH_*`
//! environment variables and finally by command line flags in `main`.
//! A missing or unparsable file falls back to defaults.

use anyhow::Result;
use clap::ValueEnum;
use mesh_routing::{RouterConfig, ScheduleConfig};
use mesh_session::ConnectionConfig;
use mesh_storage::StorageMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Shape of the simulated mesh
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Topology {
    /// Each node linked to the next
    Chain,
    /// A chain whose ends are linked as well
    Ring,
}

/// In-process simulation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// Number of nodes
    pub nodes: usize,
    /// How the nodes are linked
    pub topology: Topology,
    /// Payload of the ping packet
    pub ping_payload: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            nodes: 5,
            topology: Topology::Chain,
            ping_payload: "ping".to_string(),
        }
    }
}

/// Mesh node configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Direct link limits and health thresholds
    pub connections: ConnectionConfig,
    /// Discovery and route lifetimes
    pub router: RouterConfig,
    /// Periodic task intervals
    pub schedule: ScheduleConfig,
    /// Storage backend
    pub storage: StorageMode,
    /// Simulation settings
    pub simulation: SimulationConfig,
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<NodeConfig>(&content) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?} ({}), using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok());

        info!(
            "Final mesh configuration: nodes={}, topology={:?}, max_connections={}, \
             max_hops={}, storage={:?}",
            config.simulation.nodes,
            config.simulation.topology,
            config.connections.max_connections,
            config.router.max_hops,
            config.storage
        );
        Ok(config)
    }

    /// Apply `MESH_*` overrides read through `lookup`
    fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(n) = parse_var::<usize>(&lookup, "MESH_NODES") {
            self.simulation.nodes = n;
            info!("Node count overridden by environment: {}", n);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "MESH_MAX_CONNECTIONS") {
            self.connections.max_connections = n;
            info!("Max connections overridden by environment: {}", n);
        }
        if let Some(n) = parse_var::<usize>(&lookup, "MESH_MIN_CONNECTIONS") {
            self.connections.min_connections = n;
            info!("Min connections overridden by environment: {}", n);
        }
        if let Some(n) = parse_var::<u8>(&lookup, "MESH_MAX_HOPS") {
            self.router.max_hops = n;
            info!("Max hops overridden by environment: {}", n);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "MESH_ROUTE_TIMEOUT_SECS") {
            self.router.route_timeout_secs = secs;
            info!("Route timeout overridden by environment: {}s", secs);
        }
        if let Some(dir) = lookup("MESH_STORAGE_DIR") {
            info!("File storage enabled by environment: {}", dir);
            self.storage = StorageMode::File {
                data_dir: dir,
                snapshot_every: 1,
            };
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring {}={:?}: not a valid value", key, raw);
            None
        }
    }
}
