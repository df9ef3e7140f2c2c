//! Binary frame format for Highway.
//!
//! Frame layout (15 bytes prefix + header + body):
//!
//! ```text
//! +---------+--------------+---------------+--------------+-------------+
//! | magic   | total_length | header_length | header       | body        |
//! | 7 bytes | 4 bytes      | 4 bytes       | header_length| remainder   |
//! +---------+--------------+---------------+--------------+-------------+
//! ```
//!
//! `total_length` counts everything after itself:
//! `4 + header_length + body_length`. Lengths are unsigned big-endian.
//! Frames may sit back to back in one buffer or span several reads.

use crate::error::ProtocolError;
use crate::header::WireHeader;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Magic bytes opening every frame: "HWY.RPC"
pub const MAGIC: [u8; 7] = *b"HWY.RPC";

/// Width of each length field.
const LENGTH_FIELD_SIZE: usize = 4;

/// Bytes before the header: magic + total length + header length (7+4+4 = 15).
pub const FRAME_PREFIX_SIZE: usize = MAGIC.len() + 2 * LENGTH_FIELD_SIZE;

/// A de-framed message: raw header bytes and opaque body bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub header: Bytes,
    pub body: Bytes,
}

impl RawFrame {
    pub fn new(header: impl Into<Bytes>, body: impl Into<Bytes>) -> Self {
        Self {
            header: header.into(),
            body: body.into(),
        }
    }

    /// Parses the header bytes.
    pub fn decode_header(&self) -> Result<WireHeader, ProtocolError> {
        WireHeader::decode(&self.header)
    }

    /// Encodes the frame into a fresh buffer.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf =
            BytesMut::with_capacity(FRAME_PREFIX_SIZE + self.header.len() + self.body.len());
        write_frame(&mut buf, &self.header, &self.body)?;
        Ok(buf)
    }
}

/// Writes one frame to `sink`.
///
/// Sizes are validated before anything is written, so a failed call leaves
/// the sink untouched.
pub fn write_frame<B: BufMut>(
    sink: &mut B,
    header: &[u8],
    body: &[u8],
) -> Result<(), ProtocolError> {
    let total = (LENGTH_FIELD_SIZE + header.len() + body.len()) as u64;
    if total > MAX_FRAME_SIZE as u64 {
        return Err(ProtocolError::FrameTooLarge {
            size: total,
            max: MAX_FRAME_SIZE,
        });
    }

    // Magic (7 bytes)
    sink.put_slice(&MAGIC);

    // Total length (4 bytes)
    sink.put_u32(total as u32);

    // Header length (4 bytes)
    sink.put_u32(header.len() as u32);

    sink.put_slice(header);
    sink.put_slice(body);
    Ok(())
}

/// Reads one frame from the front of `src` using the default size ceiling.
///
/// See [`read_frame_with_limit`].
pub fn read_frame(src: &mut BytesMut) -> Result<RawFrame, ProtocolError> {
    read_frame_with_limit(src, MAX_FRAME_SIZE)
}

/// Reads one frame from the front of `src`.
///
/// Consumes exactly one frame on success and nothing on any error. Returns
/// `InsufficientData` when `src` does not yet hold the whole frame. A magic
/// mismatch is reported as soon as the buffered prefix disagrees with the
/// marker.
pub fn read_frame_with_limit(
    src: &mut BytesMut,
    max_frame_size: u32,
) -> Result<RawFrame, ProtocolError> {
    let seen = src.len().min(MAGIC.len());
    if src[..seen] != MAGIC[..seen] {
        return Err(ProtocolError::ProtocolMismatch(src[..seen].to_vec()));
    }

    if src.len() < FRAME_PREFIX_SIZE {
        return Err(ProtocolError::InsufficientData {
            needed: FRAME_PREFIX_SIZE - src.len(),
        });
    }

    // Peek at lengths without consuming
    let mut lengths = &src[MAGIC.len()..FRAME_PREFIX_SIZE];
    let total_len = lengths.get_u32();
    let header_len = lengths.get_u32();

    if (total_len as usize) < LENGTH_FIELD_SIZE {
        return Err(ProtocolError::MalformedFrame(format!(
            "total length {} shorter than header length field",
            total_len
        )));
    }

    if total_len > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: total_len as u64,
            max: max_frame_size,
        });
    }

    let available = total_len as usize - LENGTH_FIELD_SIZE;
    if header_len as usize > available {
        return Err(ProtocolError::MalformedFrame(format!(
            "header length {} exceeds frame content of {} bytes",
            header_len, available
        )));
    }

    let frame_len = MAGIC.len() + LENGTH_FIELD_SIZE + total_len as usize;
    if src.len() < frame_len {
        return Err(ProtocolError::InsufficientData {
            needed: frame_len - src.len(),
        });
    }

    src.advance(FRAME_PREFIX_SIZE);
    let header = src.split_to(header_len as usize).freeze();
    let body = src.split_to(available - header_len as usize).freeze();

    Ok(RawFrame { header, body })
}
