//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Body checksum mismatch
    #[error("body checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    Checksum {
        /// Checksum carried in the frame header
        expected: u32,
        /// Checksum computed over the received body
        actual: u32,
    },

    /// CBOR encoding failed
    #[error("cbor encode failed: {0}")]
    Encode(String),

    /// CBOR decoding failed
    #[error("cbor decode failed: {0}")]
    Decode(String),

    /// Malformed identifier text
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}
