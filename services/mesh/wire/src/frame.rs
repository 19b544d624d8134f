//! Length-prefixed, checksummed message framing.
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 body_len (BE)    | length of the CBOR body    |
//! +----------------------+----------------------------+
//! | u32 crc32 (BE)       | CRC32 over the body        |
//! +----------------------+----------------------------+
//! | body                 | CBOR-encoded MeshMessage   |
//! +----------------------+----------------------------+
//! ```

use crate::codec::{decode_body, encode_body};
use crate::{MeshMessage, WireError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

/// Bytes preceding the body
pub const FRAME_HEADER_SIZE: usize = 8;

/// Default maximum body size (1 MiB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Hard maximum body size (16 MiB)
pub const HARD_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encode a message into a single frame
pub fn encode_frame(message: &MeshMessage, max_frame_size: usize) -> Result<Bytes, WireError> {
    let body = encode_body(message)?;
    if body.len() > max_frame_size.min(HARD_MAX_FRAME_SIZE) {
        return Err(WireError::Size(body.len()));
    }

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_u32(crc32fast::hash(&body));
    buf.put_slice(&body);

    Ok(buf.freeze())
}

/// Incremental frame decoder
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a decoder with the default size limit
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a decoder with a custom size limit (capped at the hard maximum)
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(HARD_MAX_FRAME_SIZE),
        }
    }

    /// Decode one message from the front of `buf`.
    ///
    /// Returns `Ok(None)` until a complete frame is buffered. Consumed bytes
    /// are removed from `buf`.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<MeshMessage>, WireError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let body_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if body_len > self.max_frame_size {
            return Err(WireError::Size(body_len));
        }

        if buf.len() < FRAME_HEADER_SIZE + body_len {
            return Ok(None);
        }

        buf.advance(4);
        let expected_crc = buf.get_u32();
        let body = buf.split_to(body_len).freeze();

        let actual_crc = crc32fast::hash(&body);
        if actual_crc != expected_crc {
            return Err(WireError::Checksum {
                expected: expected_crc,
                actual: actual_crc,
            });
        }

        trace!("Decoded frame with {} byte body", body_len);
        decode_body(&body).map(Some)
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
