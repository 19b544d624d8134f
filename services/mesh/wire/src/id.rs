//! Node and connection identifiers.

use crate::WireError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Length in bytes of every identifier on the wire
pub const ID_LEN: usize = 32;

/// Node identifier, the BLAKE3 hash of the node's public key
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; ID_LEN]);

impl NodeId {
    /// Wrap raw identifier bytes
    pub const fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive the identifier of a node from its public key
    pub fn from_public_key(public_key: &[u8]) -> Self {
        Self(*blake3::hash(public_key).as_bytes())
    }

    /// Parse a full-length hex identifier
    pub fn from_hex(s: &str) -> Result<Self, WireError> {
        let raw = hex::decode(s).map_err(|_| WireError::InvalidId(s.to_string()))?;
        let bytes: [u8; ID_LEN] = raw
            .try_into()
            .map_err(|_| WireError::InvalidId(s.to_string()))?;
        Ok(Self(bytes))
    }

    /// Raw identifier bytes
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Full hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex characters, used in log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}

/// Identifier of a direct link between two nodes.
///
/// Both endpoints derive the same value: the two node IDs are sorted into
/// canonical order before hashing.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId([u8; ID_LEN]);

impl ConnectionId {
    /// Compute the connection ID for the link between `a` and `b`
    pub fn between(a: &NodeId, b: &NodeId) -> Self {
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        let mut hasher = blake3::Hasher::new();
        hasher.update(low.as_bytes());
        hasher.update(high.as_bytes());
        Self(*hasher.finalize().as_bytes())
    }

    /// Raw identifier bytes
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Full hex form
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a full-length hex identifier
    pub fn from_hex(s: &str) -> Result<Self, WireError> {
        let raw = hex::decode(s).map_err(|_| WireError::InvalidId(s.to_string()))?;
        let bytes: [u8; ID_LEN] = raw
            .try_into()
            .map_err(|_| WireError::InvalidId(s.to_string()))?;
        Ok(Self(bytes))
    }

    /// First 8 hex characters, used in log lines
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.short())
    }
}
