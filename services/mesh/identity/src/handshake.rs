//! Signed handshake exchanged when a link is opened.
//!
//! The dialing node presents a [`Handshake`]: its claimed node ID, its public
//! key, an opaque payload (whatever the transport needs, e.g. an offer) and a
//! signature over that payload. The accepting node checks that the claimed
//! ID is the hash of the key and that the signature verifies, then answers
//! with a [`HandshakeAnswer`] signed over the shared connection ID.

use crate::{IdentityError, NodeIdentity, SignatureVerifier};
use mesh_wire::{ConnectionId, NodeId};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Handshake presented by the dialing node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Node ID the peer claims
    pub node_id: NodeId,
    /// Peer's declared public key
    pub public_key: Vec<u8>,
    /// Opaque transport payload
    pub payload: Vec<u8>,
    /// Signature over `payload`
    pub signature: Vec<u8>,
}

impl Handshake {
    /// Build a handshake signed by `identity`
    pub fn signed(identity: &NodeIdentity, payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        let signature = identity.sign(&payload).to_vec();
        Self {
            node_id: identity.node_id(),
            public_key: identity.public_key().to_vec(),
            payload,
            signature,
        }
    }

    /// Check the handshake against the node ID the connection claims to come from
    pub fn verify(
        &self,
        claimed_peer: &NodeId,
        verifier: &dyn SignatureVerifier,
    ) -> Result<(), IdentityError> {
        verify_claim(claimed_peer, &self.node_id, &self.public_key)?;

        if !verifier.verify(&self.payload, &self.signature, &self.public_key) {
            debug!("Handshake signature from {} did not verify", claimed_peer.short());
            return Err(IdentityError::InvalidSignature(*claimed_peer));
        }

        Ok(())
    }
}

/// Answer returned by the accepting node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeAnswer {
    /// Connection ID both endpoints derive
    pub connection_id: ConnectionId,
    /// Answering node
    pub node_id: NodeId,
    /// Answering node's public key
    pub public_key: Vec<u8>,
    /// Signature over the connection ID bytes
    pub signature: Vec<u8>,
}

impl HandshakeAnswer {
    /// Build an answer signed by `identity`
    pub fn signed(identity: &NodeIdentity, connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            node_id: identity.node_id(),
            public_key: identity.public_key().to_vec(),
            signature: identity.sign(connection_id.as_bytes()).to_vec(),
        }
    }

    /// Check the answer came from `expected_peer` and covers the expected link
    pub fn verify(
        &self,
        local_id: &NodeId,
        expected_peer: &NodeId,
        verifier: &dyn SignatureVerifier,
    ) -> Result<(), IdentityError> {
        verify_claim(expected_peer, &self.node_id, &self.public_key)?;

        let expected = ConnectionId::between(local_id, expected_peer);
        if self.connection_id != expected {
            return Err(IdentityError::ConnectionMismatch);
        }

        if !verifier.verify(self.connection_id.as_bytes(), &self.signature, &self.public_key) {
            return Err(IdentityError::InvalidSignature(*expected_peer));
        }

        Ok(())
    }
}

fn verify_claim(
    claimed: &NodeId,
    presented: &NodeId,
    public_key: &[u8],
) -> Result<(), IdentityError> {
    if presented != claimed {
        return Err(IdentityError::NodeIdMismatch {
            claimed: *claimed,
            derived: *presented,
        });
    }

    let derived = NodeId::from_public_key(public_key);
    if derived != *claimed {
        return Err(IdentityError::NodeIdMismatch {
            claimed: *claimed,
            derived,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Ed25519Verifier;

    #[test]
    fn test_valid_handshake() {
        let peer = NodeIdentity::generate();
        let hs = Handshake::signed(&peer, b"offer".to_vec());
        assert!(hs.verify(&peer.node_id(), &Ed25519Verifier).is_ok());
    }

    #[test]
    fn test_claimed_id_not_hash_of_key() {
        let peer = NodeIdentity::generate();
        let impostor = NodeIdentity::generate();

        // Impostor signs correctly with its own key but claims the peer's ID
        let mut hs = Handshake::signed(&impostor, b"offer".to_vec());
        hs.node_id = peer.node_id();

        assert!(matches!(
            hs.verify(&peer.node_id(), &Ed25519Verifier),
            Err(IdentityError::NodeIdMismatch { .. })
        ));
    }

    #[test]
    fn test_handshake_from_other_node() {
        let peer = NodeIdentity::generate();
        let other = NodeIdentity::generate();
        let hs = Handshake::signed(&other, b"offer".to_vec());
        assert!(hs.verify(&peer.node_id(), &Ed25519Verifier).is_err());
    }

    #[test]
    fn test_bad_signature() {
        let peer = NodeIdentity::generate();
        let mut hs = Handshake::signed(&peer, b"offer".to_vec());
        hs.payload = b"tampered".to_vec();

        assert!(matches!(
            hs.verify(&peer.node_id(), &Ed25519Verifier),
            Err(IdentityError::InvalidSignature(_))
        ));
    }

    #[test]
    fn test_answer_roundtrip() {
        let local = NodeIdentity::generate();
        let remote = NodeIdentity::generate();
        let id = ConnectionId::between(&local.node_id(), &remote.node_id());

        let answer = HandshakeAnswer::signed(&remote, id);
        assert!(answer
            .verify(&local.node_id(), &remote.node_id(), &Ed25519Verifier)
            .is_ok());

        let stranger = NodeIdentity::generate();
        assert!(answer
            .verify(&stranger.node_id(), &remote.node_id(), &Ed25519Verifier)
            .is_err());
    }
}
