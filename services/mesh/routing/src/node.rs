//! Node runtime: inbound dispatch and periodic maintenance.

use crate::mesh_router::MeshRouter;
use mesh_session::{ConnectionManager, Envelope, MeshEvent};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Intervals of the periodic tasks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Connection health sweep
    pub health_check_interval_secs: u64,
    /// Expired route purge and stale link cleanup
    pub cleanup_interval_secs: u64,
    /// Neighbor route refresh and table exchange
    pub update_routes_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            cleanup_interval_secs: 300,
            update_routes_interval_secs: 120,
        }
    }
}

impl ScheduleConfig {
    /// Health sweep interval
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs.max(1))
    }

    /// Cleanup interval
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    /// Route update interval
    pub fn update_routes_interval(&self) -> Duration {
        Duration::from_secs(self.update_routes_interval_secs.max(1))
    }
}

/// One running mesh node.
///
/// Owns the tasks that feed inbound envelopes to the router, run the
/// periodic sweeps and drop routes when links close. Every task watches
/// the same shutdown channel.
pub struct MeshNode {
    connections: Arc<ConnectionManager>,
    router: Arc<MeshRouter>,
    schedule: ScheduleConfig,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl MeshNode {
    /// Wrap a router; nothing runs until [`MeshNode::start`]
    pub fn new(router: Arc<MeshRouter>, schedule: ScheduleConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            connections: Arc::clone(router.connections()),
            router,
            schedule,
            shutdown_tx,
            tasks: Vec::new(),
        }
    }

    /// Router of this node
    pub fn router(&self) -> &Arc<MeshRouter> {
        &self.router
    }

    /// Connection manager of this node
    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Spawn the inbound loop, the periodic tasks and the event listener
    pub fn start(&mut self, inbound: mpsc::UnboundedReceiver<Envelope>) {
        info!(
            "Starting mesh node {} (health {:?}, cleanup {:?}, update {:?})",
            self.router.local_id().short(),
            self.schedule.health_check_interval(),
            self.schedule.cleanup_interval(),
            self.schedule.update_routes_interval()
        );
        self.tasks.push(self.spawn_inbound(inbound));
        self.tasks.push(self.spawn_event_listener());
        self.tasks.push(self.spawn_health_check());
        self.tasks.push(self.spawn_cleanup());
        self.tasks.push(self.spawn_route_updates());
    }

    fn spawn_inbound(&self, mut inbound: mpsc::UnboundedReceiver<Envelope>) -> JoinHandle<()> {
        let router = Arc::clone(&self.router);
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    envelope = inbound.recv() => {
                        let Some(envelope) = envelope else {
                            debug!("Inbound channel closed");
                            break;
                        };
                        let router = Arc::clone(&router);
                        tokio::spawn(async move {
                            let Envelope { from, message, size } = envelope;
                            let recorded = router
                                .connections()
                                .record_inbound(&from, size as u64)
                                .await;
                            if let Err(e) = recorded {
                                debug!("Inbound from {} not recorded: {}", from.short(), e);
                            }
                            let kind = message.kind();
                            if let Err(e) = router.handle_message(message, from).await {
                                debug!("Handling {} from {} failed: {}", kind, from.short(), e);
                            }
                        });
                    }
                }
            }
        })
    }

    fn spawn_event_listener(&self) -> JoinHandle<()> {
        let router = Arc::clone(&self.router);
        let mut events = self.connections.events().subscribe();
        let mut shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    record = events.recv() => match record {
                        Ok(record) => {
                            if let MeshEvent::ConnectionClosed { peer, .. } = record.event {
                                if let Err(e) = router.handle_connection_closed(&peer).await {
                                    warn!("Route invalidation for {} failed: {}", peer.short(), e);
                                }
                            }
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            warn!("Event listener lagged, {} events skipped", skipped);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    fn spawn_health_check(&self) -> JoinHandle<()> {
        let connections = Arc::clone(&self.connections);
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = self.schedule.health_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => match connections.health_check().await {
                        Ok(report) => debug!("Health check: {:?}", report),
                        Err(e) => error!("Health check failed: {}", e),
                    },
                }
            }
        })
    }

    fn spawn_cleanup(&self) -> JoinHandle<()> {
        let router = Arc::clone(&self.router);
        let connections = Arc::clone(&self.connections);
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = self.schedule.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = router.cleanup_expired_routes().await {
                            error!("Route cleanup failed: {}", e);
                        }
                        match connections.cleanup_stale().await {
                            Ok(0) => {}
                            Ok(closed) => info!("Closed {} stale connections", closed),
                            Err(e) => error!("Stale connection cleanup failed: {}", e),
                        }
                    }
                }
            }
        })
    }

    fn spawn_route_updates(&self) -> JoinHandle<()> {
        let router = Arc::clone(&self.router);
        let mut shutdown = self.shutdown_tx.subscribe();
        let period = self.schedule.update_routes_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => match router.update_routes().await {
                        Ok(neighbors) => debug!("Refreshed routes from {} neighbors", neighbors),
                        Err(e) => error!("Route update failed: {}", e),
                    },
                }
            }
        })
    }

    /// Stop every task and close all links
    pub async fn shutdown(mut self) -> usize {
        info!("Stopping mesh node {}", self.router.local_id().short());
        let _ = self.shutdown_tx.send(true);

        let closed = match self.connections.disconnect_all().await {
            Ok(closed) => closed,
            Err(e) => {
                warn!("Disconnect failed during shutdown: {}", e);
                0
            }
        };

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("Mesh node task panicked: {}", e);
                }
            }
        }
        info!("Mesh node stopped, {} connections closed", closed);
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_defaults() {
        let schedule = ScheduleConfig::default();
        assert_eq!(schedule.health_check_interval(), Duration::from_secs(30));
        assert_eq!(schedule.cleanup_interval(), Duration::from_secs(300));
        assert_eq!(schedule.update_routes_interval(), Duration::from_secs(120));
    }

    #[test]
    fn test_zero_interval_clamped() {
        let schedule = ScheduleConfig {
            health_check_interval_secs: 0,
            ..Default::default()
        };
        assert_eq!(schedule.health_check_interval(), Duration::from_secs(1));
    }
}
