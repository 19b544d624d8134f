//! Mesh network node binary.
//!
//! Runs an in-process mesh: N nodes linked in a chain or ring over the
//! channel transport, each with its own storage, connection manager and
//! router. Links are opened with signed handshakes, a ping packet is sent
//! from the first node to the last, and the resulting routes and counters
//! are logged before a graceful shutdown.

use anyhow::{bail, Context};
use clap::Parser;
use mesh_identity::{Ed25519Verifier, NodeIdentity};
use mesh_routing::{MeshNode, MeshRouter, OsRequestIds, RoutingError, RoutingTable};
use mesh_session::{
    establish_link, ChannelHub, ConnectionManager, EventRecord, MeshEvent, MeshEventNotifier,
};
use mesh_storage::{QualityMetrics, Storage};
use mesh_wire::{DataPacket, NodeId};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::{NodeConfig, Topology};
use logging::MeshLogFormatter;

/// In-process mesh simulation
#[derive(Parser, Debug)]
#[command(name = "mesh", version, about = "Mesh routing node simulation")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "mesh.yaml")]
    config: PathBuf,

    /// Number of nodes (overrides the config file)
    #[arg(long)]
    nodes: Option<usize>,

    /// How nodes are linked (overrides the config file)
    #[arg(long, value_enum)]
    topology: Option<Topology>,

    /// Data directory for file storage; memory storage when unset
    #[arg(long)]
    storage_dir: Option<PathBuf>,

    /// Link latency reported for every simulated link, e.g. 40ms
    #[arg(long, default_value = "40ms")]
    link_latency: humantime::Duration,

    /// How long to wait for discovery and delivery
    #[arg(long, default_value = "2s")]
    settle: humantime::Duration,

    /// Keep the mesh running this long after the ping, e.g. 5m (Ctrl+C stops early)
    #[arg(long, default_value = "0s")]
    run_for: humantime::Duration,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut env_filter = EnvFilter::new("info");
    for target in [
        "mesh",
        "mesh_node",
        "mesh_session",
        "mesh_routing",
        "mesh_storage",
        "mesh_topology",
    ] {
        env_filter = env_filter.add_directive(format!("{}={}", target, args.log_level).parse()?);
    }

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .event_format(MeshLogFormatter::new("mesh"))
        .init();

    info!("Starting mesh v{}", env!("CARGO_PKG_VERSION"));

    let mut config = NodeConfig::load_from_file(&args.config)?;
    if let Some(nodes) = args.nodes {
        config.simulation.nodes = nodes;
    }
    if let Some(topology) = args.topology {
        config.simulation.topology = topology;
    }
    if let Some(dir) = &args.storage_dir {
        config.storage = mesh_storage::StorageMode::File {
            data_dir: dir.to_string_lossy().into_owned(),
            snapshot_every: 1,
        };
    }
    if config.simulation.nodes < 2 {
        bail!("Need at least 2 nodes, got {}", config.simulation.nodes);
    }

    let hub = ChannelHub::new();
    let mut nodes = Vec::with_capacity(config.simulation.nodes);
    let mut storages = Vec::with_capacity(config.simulation.nodes);
    for index in 0..config.simulation.nodes {
        let (node, storage) = build_node(&hub, &config)
            .await
            .with_context(|| format!("building node {}", index))?;
        info!(component = "sim", node = %node.router().local_id().short(), "Node {} ready", index);
        nodes.push(node);
        storages.push(storage);
    }

    let metrics = QualityMetrics {
        latency_ms: Duration::from(args.link_latency).as_secs_f64() * 1000.0,
        packet_loss: 0.0,
        bandwidth_up: 5_000_000,
        bandwidth_down: 5_000_000,
    };
    let links = link_pairs(nodes.len(), config.simulation.topology);
    for (a, b) in &links {
        establish_link(nodes[*a].connections(), nodes[*b].connections(), metrics).await?;
    }
    info!(
        component = "sim",
        "Linked {} nodes as a {:?} ({} links)",
        nodes.len(),
        config.simulation.topology,
        links.len()
    );

    let (first, last) = (&nodes[0], &nodes[nodes.len() - 1]);
    let mut last_events = last.connections().events().subscribe();
    let delivered = send_ping(
        first.router(),
        last.router().local_id(),
        config.simulation.ping_payload.as_bytes(),
        &mut last_events,
        args.settle.into(),
    )
    .await?;
    if delivered {
        info!(component = "sim", "Ping delivered end to end");
    } else {
        warn!(component = "sim", "Ping was not delivered within {}", args.settle);
    }

    let run_for: Duration = args.run_for.into();
    if !run_for.is_zero() {
        info!(component = "sim", "Mesh running for {}", args.run_for);
        tokio::select! {
            _ = tokio::time::sleep(run_for) => {}
            _ = tokio::signal::ctrl_c() => info!(component = "sim", "Interrupted"),
        }
    }

    for node in &nodes {
        let stats = node.router().get_stats().await?;
        info!(
            component = "sim",
            node = %stats.local_id.short(),
            "{}",
            serde_json::to_string(&stats)?
        );
        if let Some(path) = node.router().plan_path(&last.router().local_id()).await? {
            debug!(
                node = %stats.local_id.short(),
                "Planned path to last node: {} hops, cost {:.3}",
                path.hop_count(),
                path.total_cost
            );
        }
    }

    for storage in &storages {
        if let Err(e) = storage.snapshot().await {
            warn!("Storage snapshot failed: {}", e);
        }
    }
    for node in nodes {
        node.shutdown().await;
    }

    info!("Mesh shutdown complete");
    Ok(())
}

async fn build_node(hub: &ChannelHub, config: &NodeConfig) -> anyhow::Result<(MeshNode, Storage)> {
    let identity = NodeIdentity::generate();
    let node_id = identity.node_id();
    let storage = Storage::from_mode(config.storage.for_node(&node_id)).await?;
    let (transport, inbound) = hub.register(node_id);

    let manager = ConnectionManager::new(
        identity,
        config.connections.clone(),
        Arc::clone(&storage.connections),
        Arc::new(transport),
        Arc::new(Ed25519Verifier),
        MeshEventNotifier::new(node_id, config.connections.event_capacity),
    );
    let router = MeshRouter::new(
        config.router.clone(),
        Arc::new(manager),
        RoutingTable::new(Arc::clone(&storage.routes)),
        Arc::new(OsRequestIds),
    );

    let mut node = MeshNode::new(Arc::new(router), config.schedule.clone());
    node.start(inbound);
    Ok((node, storage))
}

fn link_pairs(count: usize, topology: Topology) -> Vec<(usize, usize)> {
    let mut pairs: Vec<(usize, usize)> = (1..count).map(|i| (i - 1, i)).collect();
    if topology == Topology::Ring && count > 2 {
        pairs.push((count - 1, 0));
    }
    pairs
}

/// Route a packet to `destination`, waiting for discovery when needed.
///
/// Returns whether the destination reported the packet within `settle`.
async fn send_ping(
    router: &Arc<MeshRouter>,
    destination: NodeId,
    payload: &[u8],
    destination_events: &mut broadcast::Receiver<EventRecord>,
    settle: Duration,
) -> anyhow::Result<bool> {
    let packet = DataPacket::new(router.local_id(), destination, payload.to_vec());
    let deadline = tokio::time::Instant::now() + settle;

    loop {
        match router.route_packet(packet.clone()).await {
            Ok(decision) => {
                info!(component = "sim", "Ping sent: {:?}", decision);
                break;
            }
            Err(RoutingError::UnreachableDestination(_))
                if tokio::time::Instant::now() < deadline =>
            {
                debug!(component = "sim", "Ping waiting for discovery");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => {
                warn!(component = "sim", "Ping failed: {}", e);
                return Ok(false);
            }
        }
    }

    let received = tokio::time::timeout_at(deadline, async {
        loop {
            match destination_events.recv().await {
                Ok(record) => {
                    if let MeshEvent::PacketReceived { packet } = record.event {
                        info!(
                            component = "sim",
                            "Ping arrived after {} hops via {:?}",
                            packet.hop_count,
                            packet.path.iter().map(|n| n.short()).collect::<Vec<_>>()
                        );
                        return true;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await;
    Ok(received.unwrap_or(false))
}
