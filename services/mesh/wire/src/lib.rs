//! Node identifiers, routing control messages, and frame codec for mesh.
//!
//! This crate provides the types every other mesh crate exchanges: the
//! hash-derived [`NodeId`], the symmetric [`ConnectionId`], the
//! [`MeshMessage`] family (data packets, RREQ/RREP discovery messages and
//! route table exchange), and a checksummed CBOR frame codec used by
//! byte-oriented transports.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod id;
pub mod message;

pub use codec::{decode_body, encode_body};
pub use error::WireError;
pub use frame::{
    encode_frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE, HARD_MAX_FRAME_SIZE,
};
pub use id::{ConnectionId, NodeId, ID_LEN};
pub use message::{
    now_millis, AdvertisedRoute, DataPacket, MeshMessage, RouteReply, RouteRequest,
    RouteTableAdvert, RouteTableRequest,
};
