//! Wire header model and its compact binary codec.
//!
//! Header layout (all integers big-endian):
//!
//! ```text
//! +----------------+-------+-----------------------+---------------+---------+
//! | correlation_id | flags | operation             | context_count | entries |
//! | 8 bytes        | 1 byte| 4 bytes len + UTF-8   | 4 bytes       | ...     |
//! +----------------+-------+-----------------------+---------------+---------+
//! entry = | key_len (4) | key | value_len (4) | value |
//! ```
//!
//! An empty context is written as a zero count, never omitted.

use crate::context::ContextMap;
use crate::error::ProtocolError;
use bytes::{Buf, BufMut, BytesMut};

/// Fixed part of every header: correlation id, flags, operation length and
/// context count.
const HEADER_FIXED_SIZE: usize = 8 + 1 + 4 + 4;

/// Smallest possible encoded context entry (two empty strings).
const MIN_ENTRY_SIZE: usize = 4 + 4;

/// Header flags bitfield.
///
/// Bits without a defined meaning are carried through untouched so newer
/// peers can extend the byte.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct HeaderFlags(u8);

impl HeaderFlags {
    /// Message is a response.
    pub const RESPONSE: u8 = 1 << 0;
    /// Response carries a failure payload.
    pub const FAILURE: u8 = 1 << 1;
    /// Request expects no response.
    pub const ONE_WAY: u8 = 1 << 2;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_response(mut self) -> Self {
        self.0 |= Self::RESPONSE;
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.0 |= Self::FAILURE;
        self
    }

    pub fn with_one_way(mut self) -> Self {
        self.0 |= Self::ONE_WAY;
        self
    }

    pub fn is_response(&self) -> bool {
        self.0 & Self::RESPONSE != 0
    }

    pub fn is_failure(&self) -> bool {
        self.0 & Self::FAILURE != 0
    }

    pub fn is_one_way(&self) -> bool {
        self.0 & Self::ONE_WAY != 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }
}

/// Outcome carried by a response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Ok,
    Failure,
}

impl ResponseStatus {
    pub fn is_ok(&self) -> bool {
        *self == ResponseStatus::Ok
    }
}

/// Per-message metadata. Built fresh for every encode and decode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireHeader {
    /// Caller-assigned on requests, echoed on responses.
    pub correlation_id: u64,
    pub flags: HeaderFlags,
    /// Qualified operation name. Empty on responses.
    pub operation: String,
    /// Propagated call context.
    pub context: ContextMap,
}

impl WireHeader {
    pub fn request(correlation_id: u64, operation: impl Into<String>, context: ContextMap) -> Self {
        Self {
            correlation_id,
            flags: HeaderFlags::new(),
            operation: operation.into(),
            context,
        }
    }

    pub fn response(correlation_id: u64, status: ResponseStatus, context: ContextMap) -> Self {
        let flags = match status {
            ResponseStatus::Ok => HeaderFlags::new().with_response(),
            ResponseStatus::Failure => HeaderFlags::new().with_response().with_failure(),
        };
        Self {
            correlation_id,
            flags,
            operation: String::new(),
            context,
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags.is_response()
    }

    pub fn status(&self) -> ResponseStatus {
        if self.flags.is_failure() {
            ResponseStatus::Failure
        } else {
            ResponseStatus::Ok
        }
    }

    /// Returns the number of bytes `encode` will produce.
    pub fn encoded_len(&self) -> usize {
        HEADER_FIXED_SIZE
            + self.operation.len()
            + self
                .context
                .iter()
                .map(|(k, v)| MIN_ENTRY_SIZE + k.len() + v.len())
                .sum::<usize>()
    }

    /// Serializes the header. Same content always yields the same bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Appends the serialized header to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let count = length_field(self.context.len(), "context count")?;
        buf.reserve(self.encoded_len());

        buf.put_u64(self.correlation_id);
        buf.put_u8(self.flags.bits());
        put_str(buf, &self.operation, "operation")?;
        buf.put_u32(count);
        for (key, value) in self.context.iter() {
            put_str(buf, key, "context key")?;
            put_str(buf, value, "context value")?;
        }
        Ok(())
    }

    /// Deserializes a header. Every byte must be consumed.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = bytes;

        if buf.remaining() < HEADER_FIXED_SIZE {
            return Err(ProtocolError::MalformedHeader(format!(
                "truncated: {} bytes, need at least {}",
                buf.remaining(),
                HEADER_FIXED_SIZE
            )));
        }

        let correlation_id = buf.get_u64();
        let flags = HeaderFlags::from_bits(buf.get_u8());
        let operation = take_str(&mut buf, "operation")?;

        let count = take_u32(&mut buf, "context count")? as usize;
        if count > buf.remaining() / MIN_ENTRY_SIZE {
            return Err(ProtocolError::MalformedHeader(format!(
                "context count {} exceeds remaining {} bytes",
                count,
                buf.remaining()
            )));
        }

        let mut context = ContextMap::with_capacity(count);
        for _ in 0..count {
            let key = take_str(&mut buf, "context key")?;
            let value = take_str(&mut buf, "context value")?;
            if context.insert(key, value).is_some() {
                return Err(ProtocolError::MalformedHeader(
                    "duplicate context key".to_string(),
                ));
            }
        }

        if buf.has_remaining() {
            return Err(ProtocolError::MalformedHeader(format!(
                "{} trailing bytes",
                buf.remaining()
            )));
        }

        Ok(Self {
            correlation_id,
            flags,
            operation,
            context,
        })
    }

    /// Reads only the correlation id and flags, for routing a frame before
    /// it is fully decoded.
    pub fn peek_routing(bytes: &[u8]) -> Result<(u64, HeaderFlags), ProtocolError> {
        if bytes.len() < 9 {
            return Err(ProtocolError::MalformedHeader(format!(
                "truncated: {} bytes, need at least 9",
                bytes.len()
            )));
        }
        let mut buf = bytes;
        let correlation_id = buf.get_u64();
        let flags = HeaderFlags::from_bits(buf.get_u8());
        Ok((correlation_id, flags))
    }
}

fn length_field(len: usize, field: &str) -> Result<u32, ProtocolError> {
    u32::try_from(len)
        .map_err(|_| ProtocolError::MalformedHeader(format!("{} too long: {}", field, len)))
}

fn put_str(buf: &mut BytesMut, value: &str, field: &str) -> Result<(), ProtocolError> {
    buf.put_u32(length_field(value.len(), field)?);
    buf.put_slice(value.as_bytes());
    Ok(())
}

fn take_u32(buf: &mut &[u8], field: &str) -> Result<u32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::MalformedHeader(format!(
            "truncated {} length",
            field
        )));
    }
    Ok(buf.get_u32())
}

fn take_str(buf: &mut &[u8], field: &str) -> Result<String, ProtocolError> {
    let len = take_u32(buf, field)? as usize;
    if buf.remaining() < len {
        return Err(ProtocolError::MalformedHeader(format!(
            "truncated {}: need {} bytes, have {}",
            field,
            len,
            buf.remaining()
        )));
    }
    let value = std::str::from_utf8(&buf[..len])
        .map_err(|_| ProtocolError::MalformedHeader(format!("invalid UTF-8 in {}", field)))?
        .to_string();
    buf.advance(len);
    Ok(value)
}
