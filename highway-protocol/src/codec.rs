//! Request/response encoding and decoding on top of the frame codec.

use crate::body::{BodyCodec, Operation};
use crate::context::ContextMap;
use crate::error::{BodyError, ProtocolError};
use crate::frame::{read_frame_with_limit, write_frame, RawFrame, FRAME_PREFIX_SIZE};
use crate::header::{ResponseStatus, WireHeader};
use crate::invocation::Invocation;
use crate::MAX_FRAME_SIZE;
use bytes::{Bytes, BytesMut};

/// Status and context to send with a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseMeta {
    pub status: ResponseStatus,
    pub context: ContextMap,
}

impl ResponseMeta {
    pub fn ok() -> Self {
        Self {
            status: ResponseStatus::Ok,
            context: ContextMap::new(),
        }
    }

    pub fn failure() -> Self {
        Self {
            status: ResponseStatus::Failure,
            context: ContextMap::new(),
        }
    }

    pub fn with_context(mut self, context: ContextMap) -> Self {
        self.context = context;
        self
    }
}

impl Default for ResponseMeta {
    fn default() -> Self {
        Self::ok()
    }
}

/// Body of a decoded response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody<T> {
    /// Successful result, decoded with the operation's response codec.
    Value(T),
    /// Failure payload. Its encoding is a convention between the peers, so it
    /// is handed back undecoded.
    Failure(Bytes),
}

/// A decoded response.
#[derive(Debug, Clone, PartialEq)]
pub struct Response<T> {
    pub correlation_id: u64,
    pub status: ResponseStatus,
    /// Context carried by the response header.
    pub context: ContextMap,
    pub body: ResponseBody<T>,
}

impl<T> Response<T> {
    pub fn is_ok(&self) -> bool {
        self.status.is_ok()
    }

    /// Returns the value, or the raw failure payload.
    pub fn into_result(self) -> Result<T, Bytes> {
        match self.body {
            ResponseBody::Value(value) => Ok(value),
            ResponseBody::Failure(payload) => Err(payload),
        }
    }
}

/// Encodes requests and responses into complete frames.
///
/// Encoding is all-or-nothing: on error no buffer is returned.
pub struct Encoder;

impl Encoder {
    /// Encodes a request for `operation` carrying the invocation's arguments
    /// and context.
    pub fn encode_request<O>(
        correlation_id: u64,
        invocation: &Invocation<O::Args>,
        operation: &O,
    ) -> Result<BytesMut, ProtocolError>
    where
        O: Operation + ?Sized,
    {
        let header = WireHeader::request(
            correlation_id,
            operation.name(),
            invocation.context_map().clone(),
        );
        Self::encode_invocation(header, invocation, operation)
    }

    /// Encodes a request that expects no response.
    pub fn encode_one_way<O>(
        correlation_id: u64,
        invocation: &Invocation<O::Args>,
        operation: &O,
    ) -> Result<BytesMut, ProtocolError>
    where
        O: Operation + ?Sized,
    {
        let mut header = WireHeader::request(
            correlation_id,
            operation.name(),
            invocation.context_map().clone(),
        );
        header.flags = header.flags.with_one_way();
        Self::encode_invocation(header, invocation, operation)
    }

    /// Encodes a response. A missing `meta` means success with an empty
    /// context. Zero-length bodies are valid.
    pub fn encode_response<T>(
        correlation_id: u64,
        meta: Option<&ResponseMeta>,
        serializer: &dyn BodyCodec<T>,
        data: &T,
    ) -> Result<BytesMut, ProtocolError> {
        let body = serializer
            .serialize(data)
            .map_err(ProtocolError::Serialization)?;
        let header = match meta {
            Some(meta) => WireHeader::response(correlation_id, meta.status, meta.context.clone()),
            None => WireHeader::response(correlation_id, ResponseStatus::Ok, ContextMap::new()),
        };
        encode_message(&header, &body)
    }

    fn encode_invocation<O>(
        header: WireHeader,
        invocation: &Invocation<O::Args>,
        operation: &O,
    ) -> Result<BytesMut, ProtocolError>
    where
        O: Operation + ?Sized,
    {
        let args = invocation.args().ok_or_else(|| {
            ProtocolError::Serialization(BodyError::new("invocation has no bound arguments"))
        })?;
        let body = operation
            .request_codec()
            .serialize(args)
            .map_err(ProtocolError::Serialization)?;
        encode_message(&header, &body)
    }
}

fn encode_message(header: &WireHeader, body: &[u8]) -> Result<BytesMut, ProtocolError> {
    let header_bytes = header.encode()?;
    let mut buf = BytesMut::with_capacity(FRAME_PREFIX_SIZE + header_bytes.len() + body.len());
    write_frame(&mut buf, &header_bytes, body)?;
    Ok(buf)
}

/// Decodes a request into `invocation`.
///
/// The header must be a request for `operation`; anything else is rejected
/// before the invocation is touched. Header context is then merged in: keys
/// carried by the header overwrite local values, other local keys are kept.
/// The merge stands even when the body then fails to deserialize.
pub fn decode_request<O>(
    invocation: &mut Invocation<O::Args>,
    header: &WireHeader,
    operation: &O,
    body: &[u8],
) -> Result<(), ProtocolError>
where
    O: Operation + ?Sized,
{
    if header.is_response() {
        return Err(ProtocolError::MalformedHeader(format!(
            "expected request header for correlation id {}",
            header.correlation_id
        )));
    }
    if header.operation != operation.name() {
        return Err(ProtocolError::MalformedHeader(format!(
            "request targets '{}', decoding as '{}'",
            header.operation,
            operation.name()
        )));
    }

    invocation.context_map_mut().merge_from(&header.context);

    let args = operation
        .request_codec()
        .deserialize(body)
        .map_err(ProtocolError::Deserialization)?;
    invocation.set_args(args);
    Ok(())
}

/// Parses `header_bytes` and decodes the request into `invocation`.
///
/// Returns the parsed header. If the body is rejected the caller can still
/// recover the correlation id with [`WireHeader::peek_routing`].
pub fn decode_request_bytes<O>(
    invocation: &mut Invocation<O::Args>,
    header_bytes: &[u8],
    operation: &O,
    body: &[u8],
) -> Result<WireHeader, ProtocolError>
where
    O: Operation + ?Sized,
{
    let header = WireHeader::decode(header_bytes)?;
    decode_request(invocation, &header, operation, body)?;
    Ok(header)
}

/// Decodes a response.
///
/// When the transport tracks a context for the pending call, header context
/// is merged into it with the same rules as [`decode_request`]. Failure
/// payloads are returned undecoded.
pub fn decode_response<T>(
    header_bytes: &[u8],
    body: Bytes,
    deserializer: &dyn BodyCodec<T>,
    pending_context: Option<&mut ContextMap>,
) -> Result<Response<T>, ProtocolError> {
    let header = WireHeader::decode(header_bytes)?;
    if !header.is_response() {
        return Err(ProtocolError::MalformedHeader(format!(
            "expected response header for correlation id {}",
            header.correlation_id
        )));
    }

    if let Some(context) = pending_context {
        context.merge_from(&header.context);
    }

    let status = header.status();
    let body = match status {
        ResponseStatus::Ok => ResponseBody::Value(
            deserializer
                .deserialize(&body)
                .map_err(ProtocolError::Deserialization)?,
        ),
        ResponseStatus::Failure => ResponseBody::Failure(body),
    };

    Ok(Response {
        correlation_id: header.correlation_id,
        status,
        context: header.context,
        body,
    })
}

/// Incremental frame decoder for stream input.
pub struct Decoder {
    buffer: BytesMut,
    max_frame_size: u32,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Overrides the largest accepted `total_length`.
    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next frame from the buffer.
    ///
    /// Returns `Ok(None)` if more data is needed. Errors leave the buffer
    /// untouched and are fatal for the stream.
    pub fn decode_frame(&mut self) -> Result<Option<RawFrame>, ProtocolError> {
        match read_frame_with_limit(&mut self.buffer, self.max_frame_size) {
            Ok(frame) => Ok(Some(frame)),
            Err(ProtocolError::InsufficientData { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
