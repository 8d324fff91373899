//! Message framing for the DDS transport.
//!
//! The transport is length-preserving: each `put` on one side surfaces as
//! exactly one message on the peer, zero-length included. Frames are a
//! 4-byte big-endian payload length followed by the payload:
//!
//! ```text
//! [u32 BE length] [payload: length bytes]
//! ```
//!
//! The length covers the payload only, so an empty message is a bare
//! zero header and is legal.

use anyhow::{bail, Result};
use bytes::{Buf, BytesMut};

/// Maximum frame payload size (16 MB).
pub const MAX_MESSAGE_SIZE: u32 = 16 * 1024 * 1024;

/// Encode one message into its wire frame.
pub fn encode_message(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Incremental frame decoder that handles partial reads.
///
/// Feed bytes via [`MessageDecoder::feed`] and extract complete messages.
/// Handles TCP-style byte stream reassembly.
#[derive(Debug, Default)]
pub struct MessageDecoder {
    buf: BytesMut,
}

impl MessageDecoder {
    /// Create a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self { buf: BytesMut::new() }
    }

    /// Feed bytes into the decoder and extract all complete messages.
    ///
    /// Incomplete data is buffered for the next call. Message boundaries are
    /// preserved exactly; frames are never coalesced or split.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame exceeds the size limit.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.buf.extend_from_slice(bytes);
        let mut messages = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }

            let length = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            if length > MAX_MESSAGE_SIZE {
                bail!("frame too large: {length} bytes (max {MAX_MESSAGE_SIZE})");
            }

            let total = 4 + length as usize;
            if self.buf.len() < total {
                break; // incomplete frame, wait for more data
            }

            self.buf.advance(4);
            messages.push(self.buf.split_to(length as usize).to_vec());
        }

        Ok(messages)
    }

    /// Returns true if the decoder has buffered partial data.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}
