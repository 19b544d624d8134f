//! CBOR encoding of message bodies.

use crate::{MeshMessage, WireError};

/// Encode a message body as CBOR
pub fn encode_body(message: &MeshMessage) -> Result<Vec<u8>, WireError> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf).map_err(|e| WireError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Decode a CBOR message body
pub fn decode_body(body: &[u8]) -> Result<MeshMessage, WireError> {
    ciborium::from_reader(body).map_err(|e| WireError::Decode(e.to_string()))
}
