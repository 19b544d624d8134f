//! Node keypairs, signed handshakes, and signature verification for mesh.
//!
//! A node's identity is an Ed25519 keypair; its [`mesh_wire::NodeId`] is the
//! BLAKE3 hash of the public key, so any peer can check a claimed ID against
//! the key presented in a [`Handshake`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod handshake;
pub mod keys;
pub mod verifier;

use mesh_wire::NodeId;
use thiserror::Error;

pub use handshake::{Handshake, HandshakeAnswer};
pub use keys::{NodeIdentity, PUBLIC_KEY_LEN, SIGNATURE_LEN};
pub use verifier::{Ed25519Verifier, SignatureVerifier};

/// Identity and handshake errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdentityError {
    /// Claimed node ID does not match the presented key
    #[error("node id mismatch: claimed {claimed}, derived {derived}")]
    NodeIdMismatch {
        /// ID the peer claimed
        claimed: NodeId,
        /// ID derived from what the peer presented
        derived: NodeId,
    },

    /// Signature did not verify
    #[error("invalid signature from {0}")]
    InvalidSignature(NodeId),

    /// Answer covers a different link
    #[error("handshake answer is for a different connection")]
    ConnectionMismatch,

    /// Malformed key material
    #[error("invalid key: {0}")]
    InvalidKey(String),
}
