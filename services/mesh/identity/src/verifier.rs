//! Signature verification capability.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use tracing::trace;

/// Verifies a signature over a payload against a public key
pub trait SignatureVerifier: Send + Sync {
    /// Returns true when `signature` is valid for `payload` under `public_key`
    fn verify(&self, payload: &[u8], signature: &[u8], public_key: &[u8]) -> bool;
}

/// Ed25519 verifier
#[derive(Debug, Clone, Copy, Default)]
pub struct Ed25519Verifier;

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, payload: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
        let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
            trace!("Rejecting public key of {} bytes", public_key.len());
            return false;
        };
        let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
            trace!("Rejecting signature of {} bytes", signature.len());
            return false;
        };

        verifying_key
            .verify(payload, &Signature::from_bytes(&sig_bytes))
            .is_ok()
    }
}
