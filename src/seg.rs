//! Segmented byte-array codec.
//!
//! Wire format: each element is `[u16 BE length][bytes]`, concatenated in
//! order. The list is not length-prefixed; decoding runs until the buffer is
//! exhausted. Zero-length elements are legal, truncated segments are not.

use anyhow::{bail, Result};

/// Maximum size of a single element (u16 length field).
pub const MAX_SEGMENT: usize = u16::MAX as usize;

/// Encode a list of byte strings into one segmented buffer.
///
/// # Errors
///
/// Returns an error if any element exceeds [`MAX_SEGMENT`] bytes.
pub fn encode<T: AsRef<[u8]>>(segments: &[T]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(segments.iter().map(|s| 2 + s.as_ref().len()).sum());
    for s in segments {
        let s = s.as_ref();
        if s.len() > MAX_SEGMENT {
            bail!("segment too large: {} bytes (max {MAX_SEGMENT})", s.len());
        }
        out.extend_from_slice(&(s.len() as u16).to_be_bytes());
        out.extend_from_slice(s);
    }
    Ok(out)
}

/// Decode a segmented buffer back into its elements.
///
/// # Errors
///
/// Returns an error if the buffer ends inside a length header or inside a
/// segment body.
pub fn decode(buf: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut segments = Vec::new();
    let mut i = 0;
    while i < buf.len() {
        if buf.len() - i < 2 {
            bail!("truncated segment header at offset {i}");
        }
        let len = u16::from_be_bytes([buf[i], buf[i + 1]]) as usize;
        i += 2;
        if buf.len() - i < len {
            bail!("truncated segment body: need {len} bytes, have {}", buf.len() - i);
        }
        segments.push(buf[i..i + len].to_vec());
        i += len;
    }
    Ok(segments)
}

/// Decode into exactly `N` elements.
///
/// Convenience for fixed-shape tuples; errors if the element count differs.
pub fn decode_exact<const N: usize>(buf: &[u8]) -> Result<[Vec<u8>; N]> {
    let parts = decode(buf)?;
    let got = parts.len();
    parts
        .try_into()
        .map_err(|_| anyhow::anyhow!("expected {N} segments, got {got}"))
}
