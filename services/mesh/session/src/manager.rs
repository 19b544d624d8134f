//! Connection manager: direct peer links, their lifecycle and health.
//!
//! The manager owns the local node's links. Each link moves
//! `Connecting -> Connected` and is deleted on close; every transition is
//! persisted to the [`ConnectionStore`] and announced through the
//! [`MeshEventNotifier`]. Capacity and duplicate checks are synchronous
//! rejections that are never retried.

use crate::config::ConnectionConfig;
use crate::error::ConnectionError;
use crate::event::{CloseReason, MeshEvent, MeshEventNotifier};
use crate::quality::quality_score;
use crate::transport::Transport;
use mesh_identity::{Handshake, HandshakeAnswer, NodeIdentity, SignatureVerifier};
use mesh_storage::{Connection, ConnectionState, ConnectionStore, QualityMetrics};
use mesh_wire::{now_millis, ConnectionId, MeshMessage, NodeId};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Outcome of one [`ConnectionManager::health_check`] pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    /// Connected links inspected
    pub checked: usize,
    /// Links closed for inactivity
    pub closed_timeout: usize,
    /// Links closed for low quality
    pub closed_poor_quality: usize,
    /// Connected links left after the pass
    pub connected: usize,
    /// Links missing to reach the minimum, 0 when healthy
    pub deficit: usize,
}

/// Owns the direct links of one node
pub struct ConnectionManager {
    identity: NodeIdentity,
    config: ConnectionConfig,
    store: Arc<dyn ConnectionStore>,
    transport: Arc<dyn Transport>,
    verifier: Arc<dyn SignatureVerifier>,
    events: MeshEventNotifier,
    /// Serializes the capacity and duplicate checks with the insert
    admission: Mutex<()>,
}

impl ConnectionManager {
    /// Create a manager for `identity`
    pub fn new(
        identity: NodeIdentity,
        config: ConnectionConfig,
        store: Arc<dyn ConnectionStore>,
        transport: Arc<dyn Transport>,
        verifier: Arc<dyn SignatureVerifier>,
        events: MeshEventNotifier,
    ) -> Self {
        Self {
            identity,
            config,
            store,
            transport,
            verifier,
            events,
            admission: Mutex::new(()),
        }
    }

    /// Local node ID
    pub fn local_id(&self) -> NodeId {
        self.identity.node_id()
    }

    /// Configuration in use
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Event notifier shared with the router
    pub fn events(&self) -> &MeshEventNotifier {
        &self.events
    }

    fn connection_id_to(&self, peer: &NodeId) -> ConnectionId {
        ConnectionId::between(&self.local_id(), peer)
    }

    /// Signed handshake the local node presents when dialing
    pub fn local_handshake(&self, payload: impl Into<Vec<u8>>) -> Handshake {
        Handshake::signed(&self.identity, payload)
    }

    /// Start a link to `peer_id` in the `Connecting` state
    pub async fn connect_to_peer(
        &self,
        peer_id: NodeId,
        peer_info: BTreeMap<String, String>,
    ) -> Result<Connection, ConnectionError> {
        let _admission = self.admission.lock().await;
        self.admit(&peer_id).await?;

        let connection = Connection::connecting(self.local_id(), peer_id, peer_info, now_millis());
        self.store.put(connection.clone()).await?;

        info!(
            "Connecting to {} (connection {})",
            peer_id.short(),
            connection.connection_id.short()
        );
        Ok(connection)
    }

    /// Accept an inbound link after checking the peer's handshake
    pub async fn accept_connection(
        &self,
        peer_id: NodeId,
        handshake: &Handshake,
    ) -> Result<HandshakeAnswer, ConnectionError> {
        handshake
            .verify(&peer_id, self.verifier.as_ref())
            .map_err(|reason| {
                warn!("Rejected handshake from {}: {}", peer_id.short(), reason);
                ConnectionError::InvalidPeerSignature {
                    peer: peer_id,
                    reason,
                }
            })?;

        let _admission = self.admission.lock().await;
        self.admit(&peer_id).await?;

        let connection =
            Connection::connecting(self.local_id(), peer_id, BTreeMap::new(), now_millis());
        let connection_id = connection.connection_id;
        self.store.put(connection).await?;

        info!(
            "Accepted connection from {} (connection {})",
            peer_id.short(),
            connection_id.short()
        );
        Ok(HandshakeAnswer::signed(&self.identity, connection_id))
    }

    /// Check the answer a dialed peer returned
    pub fn verify_answer(
        &self,
        peer_id: &NodeId,
        answer: &HandshakeAnswer,
    ) -> Result<(), ConnectionError> {
        answer
            .verify(&self.local_id(), peer_id, self.verifier.as_ref())
            .map_err(|reason| ConnectionError::InvalidPeerSignature {
                peer: *peer_id,
                reason,
            })
    }

    async fn admit(&self, peer_id: &NodeId) -> Result<(), ConnectionError> {
        if *peer_id == self.local_id() {
            return Err(ConnectionError::SelfConnection);
        }

        let connected = self.store.list_connected(&self.local_id()).await?;
        if connected.iter().any(|c| c.remote_id == *peer_id) {
            return Err(ConnectionError::AlreadyConnected(*peer_id));
        }
        if connected.len() >= self.config.max_connections {
            return Err(ConnectionError::ConnectionLimitReached {
                limit: self.config.max_connections,
            });
        }
        Ok(())
    }

    async fn load(&self, connection_id: &ConnectionId) -> Result<Connection, ConnectionError> {
        self.store
            .get(connection_id)
            .await?
            .ok_or(ConnectionError::NotFound(*connection_id))
    }

    /// Mutate a stored link in place; a link removed meanwhile is `NotFound`
    async fn modify<F>(
        &self,
        connection_id: &ConnectionId,
        mut mutate: F,
    ) -> Result<Connection, ConnectionError>
    where
        F: FnMut(&mut Connection) + Send,
    {
        self.store
            .update(connection_id, &mut mutate)
            .await?
            .ok_or(ConnectionError::NotFound(*connection_id))
    }

    /// Promote a `Connecting` link to `Connected` once the transport is up
    pub async fn mark_established(
        &self,
        connection_id: &ConnectionId,
        metrics: QualityMetrics,
    ) -> Result<Connection, ConnectionError> {
        let now = now_millis();
        let mut rejected = None;
        let connection = self
            .modify(connection_id, |connection| {
                if connection.state != ConnectionState::Connecting {
                    rejected = Some(connection.state);
                    return;
                }
                connection.state = ConnectionState::Connected;
                connection.metrics = metrics;
                connection.quality_score = quality_score(&metrics);
                connection.established_at = Some(now);
                connection.last_activity = now;
            })
            .await?;
        if let Some(actual) = rejected {
            return Err(ConnectionError::InvalidState {
                id: *connection_id,
                actual,
                expected: ConnectionState::Connecting,
            });
        }

        info!(
            "Connection to {} established (quality {:.3})",
            connection.remote_id.short(),
            connection.quality_score
        );
        self.events.notify(MeshEvent::ConnectionEstablished {
            connection_id: *connection_id,
            peer: connection.remote_id,
            quality_score: connection.quality_score,
        });
        Ok(connection)
    }

    /// Store fresh metrics and recompute the score, returning it
    pub async fn update_quality(
        &self,
        connection_id: &ConnectionId,
        metrics: QualityMetrics,
    ) -> Result<f64, ConnectionError> {
        let now = now_millis();
        let connection = self
            .modify(connection_id, |connection| {
                connection.metrics = metrics;
                connection.quality_score = quality_score(&metrics);
                connection.last_activity = now;
            })
            .await?;

        debug!(
            "Quality of link to {} now {:.3}",
            connection.remote_id.short(),
            connection.quality_score
        );
        Ok(connection.quality_score)
    }

    /// Add traffic counters to a link
    pub async fn record_transfer(
        &self,
        connection_id: &ConnectionId,
        sent: u64,
        received: u64,
    ) -> Result<(), ConnectionError> {
        let now = now_millis();
        self.modify(connection_id, |connection| {
            connection.bytes_sent = connection.bytes_sent.saturating_add(sent);
            connection.bytes_received = connection.bytes_received.saturating_add(received);
            connection.last_activity = now;
        })
        .await?;
        Ok(())
    }

    /// Account inbound traffic from a neighbor
    pub async fn record_inbound(
        &self,
        peer_id: &NodeId,
        bytes: u64,
    ) -> Result<(), ConnectionError> {
        self.record_transfer(&self.connection_id_to(peer_id), 0, bytes)
            .await
    }

    /// Send a message over the link to `peer_id`.
    ///
    /// A failed send degrades the link's measured loss before the error is
    /// returned.
    pub async fn send_to(
        &self,
        peer_id: &NodeId,
        message: &MeshMessage,
    ) -> Result<usize, ConnectionError> {
        let connection = self.load(&self.connection_id_to(peer_id)).await?;
        if !connection.is_connected() {
            return Err(ConnectionError::InvalidState {
                id: connection.connection_id,
                actual: connection.state,
                expected: ConnectionState::Connected,
            });
        }

        match self.transport.send(peer_id, message).await {
            Ok(written) => {
                self.record_transfer(&connection.connection_id, written as u64, 0)
                    .await?;
                Ok(written)
            }
            Err(source) => {
                warn!(
                    "Send of {} to {} failed: {}",
                    message.kind(),
                    peer_id.short(),
                    source
                );
                let penalty = self.config.send_failure_loss_penalty;
                let degraded = self
                    .modify(&connection.connection_id, |connection| {
                        let metrics = &mut connection.metrics;
                        metrics.packet_loss = (metrics.packet_loss + penalty).min(1.0);
                        connection.quality_score = quality_score(&connection.metrics);
                    })
                    .await;
                if let Err(e) = degraded {
                    debug!("Could not degrade link to {}: {}", peer_id.short(), e);
                }
                Err(ConnectionError::SendFailed {
                    peer: *peer_id,
                    source,
                })
            }
        }
    }

    /// Close and delete a link
    pub async fn close_connection(
        &self,
        connection_id: &ConnectionId,
        reason: CloseReason,
    ) -> Result<(), ConnectionError> {
        // Only the caller that moves the link to Closing goes on to delete it
        let mut claimed = false;
        let connection = self
            .modify(connection_id, |connection| {
                if connection.state != ConnectionState::Closing {
                    connection.state = ConnectionState::Closing;
                    claimed = true;
                }
            })
            .await?;
        if !claimed {
            return Err(ConnectionError::NotFound(*connection_id));
        }
        let peer = connection.remote_id;

        self.events.notify(MeshEvent::ConnectionClosing {
            connection_id: *connection_id,
            peer,
            reason,
        });

        self.store.remove(connection_id).await?;
        info!("Closed connection to {} ({})", peer.short(), reason);
        self.events.notify(MeshEvent::ConnectionClosed {
            connection_id: *connection_id,
            peer,
            reason,
        });
        Ok(())
    }

    /// Close every local link, returning how many were closed
    pub async fn disconnect_all(&self) -> Result<usize, ConnectionError> {
        let local_id = self.local_id();
        let mut closed = 0;
        for connection in self.store.list().await? {
            if connection.local_id != local_id {
                continue;
            }
            match self
                .close_connection(&connection.connection_id, CloseReason::Shutdown)
                .await
            {
                Ok(()) => closed += 1,
                // Closed concurrently
                Err(ConnectionError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        info!("Disconnected {} links", closed);
        Ok(closed)
    }

    /// Whether a connected link to `peer_id` exists
    pub async fn is_connected_to(&self, peer_id: &NodeId) -> Result<bool, ConnectionError> {
        Ok(self
            .store
            .get(&self.connection_id_to(peer_id))
            .await?
            .is_some_and(|c| c.is_connected()))
    }

    /// Number of connected links
    pub async fn get_connection_count(&self) -> Result<usize, ConnectionError> {
        Ok(self.store.list_connected(&self.local_id()).await?.len())
    }

    /// Connected links, best quality first
    pub async fn get_connections(&self) -> Result<Vec<Connection>, ConnectionError> {
        let mut connections = self.store.list_connected(&self.local_id()).await?;
        connections.sort_by(|a, b| b.quality_score.total_cmp(&a.quality_score));
        Ok(connections)
    }

    /// A link by ID in any state
    pub async fn get_connection(
        &self,
        connection_id: &ConnectionId,
    ) -> Result<Option<Connection>, ConnectionError> {
        Ok(self.store.get(connection_id).await?)
    }

    /// The link to `peer_id` in any state
    pub async fn get_connection_to(
        &self,
        peer_id: &NodeId,
    ) -> Result<Option<Connection>, ConnectionError> {
        self.get_connection(&self.connection_id_to(peer_id)).await
    }

    /// Highest-quality connected link whose peer is not in `exclude`
    pub async fn get_best_connection(
        &self,
        exclude: &[NodeId],
    ) -> Result<Option<Connection>, ConnectionError> {
        Ok(self
            .get_connections()
            .await?
            .into_iter()
            .find(|c| !exclude.contains(&c.remote_id)))
    }

    /// Close idle and poor links, then ask for more peers when under the minimum
    pub async fn health_check(&self) -> Result<HealthReport, ConnectionError> {
        let now = now_millis();
        let idle_limit = self.config.stale_connection_timeout();
        let connected = self.store.list_connected(&self.local_id()).await?;

        let mut report = HealthReport {
            checked: connected.len(),
            ..HealthReport::default()
        };

        for connection in connected {
            let reason = if connection.idle_for(now) > idle_limit {
                CloseReason::Timeout
            } else if connection.quality_score < self.config.poor_quality_threshold {
                CloseReason::PoorQuality
            } else {
                continue;
            };

            debug!(
                "Health check closing link to {} ({})",
                connection.remote_id.short(),
                reason
            );
            match self.close_connection(&connection.connection_id, reason).await {
                Ok(()) => match reason {
                    CloseReason::Timeout => report.closed_timeout += 1,
                    _ => report.closed_poor_quality += 1,
                },
                Err(ConnectionError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }

        report.connected = self.get_connection_count().await?;
        if report.connected < self.config.min_connections {
            report.deficit = self.config.min_connections - report.connected;
            info!(
                "Only {} connected links, need {} more",
                report.connected, report.deficit
            );
            self.events.notify(MeshEvent::NeedMorePeers {
                connected: report.connected,
                deficit: report.deficit,
            });
        }

        Ok(report)
    }

    /// Close links in any state idle past the cleanup limit
    pub async fn cleanup_stale(&self) -> Result<usize, ConnectionError> {
        let now = now_millis();
        let idle_limit = self.config.cleanup_stale_timeout();
        let local_id = self.local_id();

        let mut closed = 0;
        for connection in self.store.list().await? {
            if connection.local_id != local_id || connection.idle_for(now) <= idle_limit {
                continue;
            }
            match self
                .close_connection(&connection.connection_id, CloseReason::Stale)
                .await
            {
                Ok(()) => closed += 1,
                Err(ConnectionError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if closed > 0 {
            info!("Cleaned up {} stale links", closed);
        }
        Ok(closed)
    }
}

/// Open a link between two local managers: signed handshake, answer
/// verification, then both sides marked established with `metrics`.
pub async fn establish_link(
    dialer: &ConnectionManager,
    acceptor: &ConnectionManager,
    metrics: QualityMetrics,
) -> Result<ConnectionId, ConnectionError> {
    let dialer_id = dialer.local_id();
    let acceptor_id = acceptor.local_id();

    let handshake = dialer.local_handshake(acceptor_id.as_bytes().to_vec());
    let connection = dialer.connect_to_peer(acceptor_id, BTreeMap::new()).await?;
    let answer = acceptor.accept_connection(dialer_id, &handshake).await?;
    dialer.verify_answer(&acceptor_id, &answer)?;

    acceptor.mark_established(&answer.connection_id, metrics).await?;
    dialer.mark_established(&connection.connection_id, metrics).await?;
    Ok(connection.connection_id)
}
