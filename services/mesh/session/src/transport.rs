//! Message transport between direct neighbors.
//!
//! [`Transport`] is the seam to whatever actually moves bytes. The crate
//! ships [`ChannelHub`], an in-process transport used by tests and the
//! simulation binary: every send is encoded into a checksummed frame,
//! decoded on the receiving side and delivered as an [`Envelope`].

use async_trait::async_trait;
use bytes::BytesMut;
use dashmap::DashMap;
use mesh_wire::{encode_frame, FrameDecoder, MeshMessage, NodeId, WireError, DEFAULT_MAX_FRAME_SIZE};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Transport failures
#[derive(Error, Debug)]
pub enum TransportError {
    /// Peer is not reachable through this transport
    #[error("unknown peer {0}")]
    UnknownPeer(NodeId),
    /// Link to the peer is down
    #[error("link to {0} is down")]
    LinkDown(NodeId),
    /// Peer stopped receiving
    #[error("peer {0} closed its inbound channel")]
    Closed(NodeId),
    /// Encoding or decoding failed
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

/// Sends messages to direct neighbors
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `message` to `peer`, returning the number of bytes written
    async fn send(&self, peer: &NodeId, message: &MeshMessage) -> Result<usize, TransportError>;
}

/// A message received from a neighbor
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Neighbor that sent it
    pub from: NodeId,
    /// The message
    pub message: MeshMessage,
    /// Frame length on the wire
    pub size: usize,
}

#[derive(Default)]
struct HubInner {
    mailboxes: DashMap<NodeId, mpsc::UnboundedSender<Envelope>>,
    /// Canonically ordered pairs whose link is cut
    down_links: DashMap<(NodeId, NodeId), ()>,
}

/// In-process switchboard connecting [`ChannelTransport`]s
#[derive(Clone)]
pub struct ChannelHub {
    inner: Arc<HubInner>,
    max_frame_size: usize,
}

impl ChannelHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a hub rejecting frames larger than `max_frame_size`
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            inner: Arc::new(HubInner::default()),
            max_frame_size,
        }
    }

    /// Attach a node, returning its transport and inbound stream.
    ///
    /// Registering the same node again replaces its mailbox.
    pub fn register(&self, node: NodeId) -> (ChannelTransport, mpsc::UnboundedReceiver<Envelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.inner.mailboxes.insert(node, tx).is_some() {
            warn!("Replaced mailbox for {}", node.short());
        }
        debug!("Registered {} on channel hub", node.short());

        let transport = ChannelTransport {
            local_id: node,
            hub: self.clone(),
        };
        (transport, rx)
    }

    /// Detach a node; later sends to it fail with `UnknownPeer`
    pub fn unregister(&self, node: &NodeId) {
        self.inner.mailboxes.remove(node);
    }

    /// Cut or restore the link between two nodes (both directions)
    pub fn set_link_up(&self, a: NodeId, b: NodeId, up: bool) {
        let key = link_key(a, b);
        if up {
            self.inner.down_links.remove(&key);
        } else {
            self.inner.down_links.insert(key, ());
        }
    }

    fn deliver(
        &self,
        from: NodeId,
        to: &NodeId,
        message: &MeshMessage,
    ) -> Result<usize, TransportError> {
        if self.inner.down_links.contains_key(&link_key(from, *to)) {
            return Err(TransportError::LinkDown(*to));
        }

        let frame = encode_frame(message, self.max_frame_size)?;
        let written = frame.len();

        let mut buf = BytesMut::from(&frame[..]);
        let mut decoder = FrameDecoder::with_max_frame_size(self.max_frame_size);
        let decoded = decoder
            .decode(&mut buf)?
            .ok_or_else(|| WireError::Decode("incomplete frame".to_string()))?;

        // Clone the sender so the map guard is released before sending
        let mailbox = self
            .inner
            .mailboxes
            .get(to)
            .map(|tx| tx.clone())
            .ok_or(TransportError::UnknownPeer(*to))?;

        mailbox
            .send(Envelope {
                from,
                message: decoded,
                size: written,
            })
            .map_err(|_| TransportError::Closed(*to))?;

        trace!(
            "Delivered {} ({} bytes) {} -> {}",
            message.kind(),
            written,
            from.short(),
            to.short()
        );
        Ok(written)
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new()
    }
}

fn link_key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// One node's handle on a [`ChannelHub`]
#[derive(Clone)]
pub struct ChannelTransport {
    local_id: NodeId,
    hub: ChannelHub,
}

impl ChannelTransport {
    /// Node this transport sends as
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, peer: &NodeId, message: &MeshMessage) -> Result<usize, TransportError> {
        self.hub.deliver(self.local_id, peer, message)
    }
}
