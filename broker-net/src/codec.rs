//! Wire framing: a 32-bit big-endian length prefix followed by a
//! `bincode`-encoded `broker_core::message::Message` (§6 — the concrete
//! byte-level encoding of the distilled spec's "length-prefixed,
//! self-describing record", picked here because it is cheap to frame
//! synchronously the way the teacher's ZMTP decoder frames its messages).

use broker_core::message::Message;
use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Hard cap on a single frame's declared length, guarding against a
/// corrupt or malicious length prefix driving an unbounded allocation.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame declares length {0} exceeding the {MAX_FRAME_LEN} byte cap")]
    FrameTooLarge(u32),
    #[error("malformed frame body: {0}")]
    Malformed(String),
}

/// Incrementally decodes length-prefixed frames out of a byte stream that
/// may deliver partial reads, the same "stage into a buffer, drain
/// complete frames" shape as the teacher's `ZmtpDecoder`.
#[derive(Default)]
pub struct FrameDecoder {
    staging: BytesMut,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self { staging: BytesMut::new() }
    }

    /// Feeds freshly-read bytes into the decoder.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.staging.extend_from_slice(bytes);
    }

    /// Pulls the next complete message out of the staged bytes, if one has
    /// fully arrived.
    ///
    /// # Errors
    /// Returns `CodecError` on an oversized length prefix or a body that
    /// fails to deserialize; the caller should treat either as grounds to
    /// drop the peer with `peer_invalid` (§7).
    pub fn try_decode(&mut self) -> Result<Option<Message>, CodecError> {
        if self.staging.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(self.staging[..4].try_into().unwrap());
        if len > MAX_FRAME_LEN {
            return Err(CodecError::FrameTooLarge(len));
        }
        let total = 4 + len as usize;
        if self.staging.len() < total {
            return Ok(None);
        }
        self.staging.advance(4);
        let body = self.staging.split_to(len as usize);
        let msg = bincode::deserialize(&body).map_err(|e| CodecError::Malformed(e.to_string()))?;
        Ok(Some(msg))
    }
}

/// Encodes `msg` as a length-prefixed frame ready to write to the wire.
///
/// # Errors
/// Returns `CodecError` if `msg` fails to serialize (not expected for any
/// well-formed `Message`, but `bincode` is fallible for unbounded types).
pub fn encode_frame(msg: &Message) -> Result<Vec<u8>, CodecError> {
    let body = bincode::serialize(msg).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let mut out = Vec::with_capacity(4 + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}
