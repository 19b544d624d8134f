//! Node keypair and derived identifier.

use crate::IdentityError;
use ed25519_dalek::{Signer, SigningKey};
use mesh_wire::NodeId;
use rand::RngCore;
use std::fmt;

/// Ed25519 public key length
pub const PUBLIC_KEY_LEN: usize = 32;

/// Ed25519 signature length
pub const SIGNATURE_LEN: usize = 64;

/// A node's signing keypair together with the [`NodeId`] derived from it.
///
/// Passed explicitly into the components that need to sign or to know the
/// local node ID; there is no process-wide identity.
#[derive(Clone)]
pub struct NodeIdentity {
    signing_key: SigningKey,
    node_id: NodeId,
}

impl NodeIdentity {
    /// Generate a fresh random identity
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut secret);
        let identity = Self::from_secret_bytes(&secret);
        secret.fill(0);
        identity
    }

    /// Rebuild an identity from its 32-byte secret key
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(secret);
        let node_id = NodeId::from_public_key(signing_key.verifying_key().as_bytes());
        Self {
            signing_key,
            node_id,
        }
    }

    /// Rebuild an identity from a secret key slice of unchecked length
    pub fn from_secret_slice(secret: &[u8]) -> Result<Self, IdentityError> {
        let bytes: [u8; 32] = secret.try_into().map_err(|_| {
            IdentityError::InvalidKey(format!("secret key is {} bytes", secret.len()))
        })?;
        Ok(Self::from_secret_bytes(&bytes))
    }

    /// The derived node ID
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Public key bytes
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Sign arbitrary bytes
    pub fn sign(&self, payload: &[u8]) -> [u8; SIGNATURE_LEN] {
        self.signing_key.sign(payload).to_bytes()
    }
}

impl fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}
