//! Optional-compression frame envelope shared by both channels.
//!
//! A compressed buffer is self-describing: an 8-byte header (4-byte magic,
//! 4-byte big-endian original length) followed by the zlib body. Buffers
//! below the threshold are sent raw with no header, and `decode` sniffs the
//! magic rather than relying on negotiation.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;

use crate::errors::FrameError;

/// Magic constant identifying a compressed buffer.
pub const COMPRESS_MAGIC: u32 = 0xABE8_5CEA;

/// Size of the compression header (magic + original length).
pub const HEADER_LEN: usize = 8;

/// Default minimum payload size for compression, in bytes. Permissive on
/// purpose: control-plane messages above a trivial size always compress.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 64;

/// Wraps and unwraps payloads with the optional compression envelope.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    threshold: usize,
}

impl FrameCodec {
    /// Codec with a custom compression threshold. A threshold of zero
    /// compresses everything, including the empty payload.
    pub fn new(threshold: usize) -> Self {
        Self { threshold }
    }

    /// The configured compression threshold.
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Encode a payload for the wire.
    ///
    /// Payloads shorter than the threshold pass through unmodified and
    /// carry no header.
    pub fn encode(&self, payload: &[u8]) -> Bytes {
        if payload.len() < self.threshold {
            return Bytes::copy_from_slice(payload);
        }

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        // Writing into a Vec cannot fail.
        encoder
            .write_all(payload)
            .and_then(|()| encoder.finish())
            .map_or_else(
                |_| Bytes::copy_from_slice(payload),
                |compressed| {
                    let mut out = BytesMut::with_capacity(HEADER_LEN + compressed.len());
                    out.put_u32(COMPRESS_MAGIC);
                    out.put_u32(payload.len() as u32);
                    out.extend_from_slice(&compressed);
                    out.freeze()
                },
            )
    }

    /// Decode a buffer received from the wire.
    ///
    /// Buffers shorter than the header or without the magic are plain
    /// payloads and are returned unchanged. A matching magic with a body
    /// that fails to inflate, or inflates to a different length than the
    /// header recorded, signals corruption.
    pub fn decode(&self, buf: &[u8]) -> Result<Bytes, FrameError> {
        if buf.len() < HEADER_LEN {
            return Ok(Bytes::copy_from_slice(buf));
        }

        let mut header = &buf[..HEADER_LEN];
        if header.get_u32() != COMPRESS_MAGIC {
            return Ok(Bytes::copy_from_slice(buf));
        }
        let expected = header.get_u32() as usize;

        let mut decoder = ZlibDecoder::new(&buf[HEADER_LEN..]);
        let mut out = Vec::with_capacity(expected);
        let _ = decoder
            .read_to_end(&mut out)
            .map_err(|e| FrameError::Corrupt(e.to_string()))?;

        if out.len() != expected {
            return Err(FrameError::LengthMismatch {
                expected,
                actual: out.len(),
            });
        }

        Ok(Bytes::from(out))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_COMPRESS_THRESHOLD)
    }
}
