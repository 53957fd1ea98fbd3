//! Length-prefixed framing over a stream transport.
//!
//! Format: `[4-byte length, little-endian][exactly that many payload bytes]`.
//! A stream transport may fragment or coalesce writes arbitrarily, so the
//! decoder keeps one accumulation buffer per connection and only hands out
//! complete frames, in order.

use thiserror::Error;

/// Width of the length prefix.
pub const LEN_PREFIX: usize = 4;

/// Upper bound on a single frame's payload. A prefix above this cannot be a
/// real message and terminates the connection.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame length {len} exceeds maximum {max}")]
    Oversize { len: usize, max: usize },
}

/// Encode one payload as a self-delimiting frame, safe to write at any size.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::Oversize {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let mut out = Vec::with_capacity(LEN_PREFIX + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Incremental frame reassembly for one connection.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one chunk of bytes as received from the transport.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pop the next complete frame, if the buffer holds one.
    ///
    /// Call in a loop after every [`push`](Self::push): a single read may
    /// carry several back-to-back frames, and a single frame may need many
    /// reads before it completes.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut prefix = [0u8; LEN_PREFIX];
        prefix.copy_from_slice(&self.buf[..LEN_PREFIX]);
        let len = u32::from_le_bytes(prefix) as usize;
        if len > MAX_FRAME_LEN {
            return Err(FrameError::Oversize {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        let frame = self.buf[LEN_PREFIX..LEN_PREFIX + len].to_vec();
        self.buf.drain(..LEN_PREFIX + len);
        Ok(Some(frame))
    }

    /// Bytes buffered but not yet forming a complete frame.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}
