//! Routing control and data messages exchanged between neighbors.

use crate::NodeId;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Application packet travelling toward `destination_id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPacket {
    /// Node that originated the packet
    pub source_id: NodeId,
    /// Final destination
    pub destination_id: NodeId,
    /// Links traversed so far
    pub hop_count: u8,
    /// Nodes that forwarded the packet, in order
    pub path: Vec<NodeId>,
    /// Opaque application payload
    pub payload: Bytes,
}

impl DataPacket {
    /// Create a packet that has not been forwarded yet
    pub fn new(source_id: NodeId, destination_id: NodeId, payload: impl Into<Bytes>) -> Self {
        Self {
            source_id,
            destination_id,
            hop_count: 0,
            path: Vec::new(),
            payload: payload.into(),
        }
    }

    /// Return a copy stamped for the next link: hop count incremented and
    /// `via` appended to the path
    pub fn stamped(&self, via: NodeId) -> Self {
        let mut next = self.clone();
        next.hop_count = next.hop_count.saturating_add(1);
        next.path.push(via);
        next
    }
}

/// Route request (RREQ), flooded to find a path to `destination_id`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRequest {
    /// Random identifier, unique per origination
    pub request_id: u64,
    /// Node being searched for
    pub destination_id: NodeId,
    /// Node that originated the request
    pub source_id: NodeId,
    /// Links traversed so far
    pub hop_count: u8,
    /// Origination time (Unix millis)
    pub timestamp: u64,
}

impl RouteRequest {
    /// Create a fresh request at its origin
    pub fn new(request_id: u64, source_id: NodeId, destination_id: NodeId) -> Self {
        Self {
            request_id,
            destination_id,
            source_id,
            hop_count: 0,
            timestamp: now_millis(),
        }
    }

    /// Copy of this request for re-broadcast one hop further
    pub fn forwarded(&self) -> Self {
        let mut next = self.clone();
        next.hop_count = next.hop_count.saturating_add(1);
        next
    }
}

/// Route reply (RREP), travelling back toward the requester
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteReply {
    /// Request being answered
    pub request_id: u64,
    /// The original requester
    pub destination_id: NodeId,
    /// Node the reply advertises a route to
    pub source_id: NodeId,
    /// Node that generated the reply
    pub replier_id: NodeId,
    /// Links between the receiving node and `source_id`
    pub hop_count: u8,
    /// Creation time (Unix millis)
    pub timestamp: u64,
}

impl RouteReply {
    /// Copy of this reply for forwarding one hop further from `source_id`
    pub fn forwarded(&self) -> Self {
        let mut next = self.clone();
        next.hop_count = next.hop_count.saturating_add(1);
        next
    }
}

/// Request for a neighbor's routing table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTableRequest {
    /// Node asking for the table
    pub requester_id: NodeId,
    /// Creation time (Unix millis)
    pub timestamp: u64,
}

impl RouteTableRequest {
    /// Create a request from `requester_id`
    pub fn new(requester_id: NodeId) -> Self {
        Self {
            requester_id,
            timestamp: now_millis(),
        }
    }
}

/// One advertised destination in a route table summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvertisedRoute {
    /// Reachable destination
    pub destination_id: NodeId,
    /// Hops from the advertiser
    pub hop_count: u8,
    /// Path quality from the advertiser
    pub path_quality: f64,
}

/// Summary of a node's best routes, sent in answer to a [`RouteTableRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteTableAdvert {
    /// Node whose table this is
    pub advertiser_id: NodeId,
    /// Advertised destinations
    pub entries: Vec<AdvertisedRoute>,
    /// Creation time (Unix millis)
    pub timestamp: u64,
}

impl RouteTableAdvert {
    /// Create an advertisement
    pub fn new(advertiser_id: NodeId, entries: Vec<AdvertisedRoute>) -> Self {
        Self {
            advertiser_id,
            entries,
            timestamp: now_millis(),
        }
    }
}

/// Every message the routing core sends through a transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeshMessage {
    /// Application data
    Packet(DataPacket),
    /// Route discovery request
    RouteRequest(RouteRequest),
    /// Route discovery reply
    RouteReply(RouteReply),
    /// Ask a neighbor for its table
    RouteTableRequest(RouteTableRequest),
    /// A neighbor's table
    RouteTable(RouteTableAdvert),
}

impl MeshMessage {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            MeshMessage::Packet(_) => "packet",
            MeshMessage::RouteRequest(_) => "rreq",
            MeshMessage::RouteReply(_) => "rrep",
            MeshMessage::RouteTableRequest(_) => "route_table_request",
            MeshMessage::RouteTable(_) => "route_table",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(seed: &str) -> NodeId {
        NodeId::from_public_key(seed.as_bytes())
    }

    #[test]
    fn test_packet_stamping() {
        let a = node("a");
        let b = node("b");
        let c = node("c");

        let packet = DataPacket::new(a, c, b"hello".to_vec());
        assert_eq!(packet.hop_count, 0);
        assert!(packet.path.is_empty());

        let next = packet.stamped(a).stamped(b);
        assert_eq!(next.hop_count, 2);
        assert_eq!(next.path, vec![a, b]);
        // original untouched
        assert_eq!(packet.hop_count, 0);
    }

    #[test]
    fn test_request_forwarding() {
        let req = RouteRequest::new(42, node("a"), node("z"));
        assert_eq!(req.hop_count, 0);

        let fwd = req.forwarded().forwarded();
        assert_eq!(fwd.hop_count, 2);
        assert_eq!(fwd.request_id, 42);
        assert_eq!(fwd.timestamp, req.timestamp);
    }

    #[test]
    fn test_hop_count_saturates() {
        let mut req = RouteRequest::new(1, node("a"), node("z"));
        req.hop_count = u8::MAX;
        assert_eq!(req.forwarded().hop_count, u8::MAX);
    }

    #[test]
    fn test_message_kind() {
        let msg = MeshMessage::RouteTableRequest(RouteTableRequest::new(node("a")));
        assert_eq!(msg.kind(), "route_table_request");
    }

    #[test]
    fn test_json_shape() {
        let advert = RouteTableAdvert::new(
            node("a"),
            vec![AdvertisedRoute {
                destination_id: node("b"),
                hop_count: 1,
                path_quality: 0.5,
            }],
        );
        let json = serde_json::to_value(MeshMessage::RouteTable(advert)).unwrap();
        assert!(json.get("RouteTable").is_some());
    }
}
