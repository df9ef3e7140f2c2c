//! # highway-protocol
//!
//! Binary wire protocol for the Highway RPC transport.
//!
//! This crate provides:
//! - Magic-prefixed, length-delimited framing for TCP streams
//! - A compact binary header carrying correlation id, flags and call context
//! - Request/response encoding on top of pluggable body codecs
//! - Context propagation with caller-side precedence rules
//!
//! Everything here is a pure transformation over byte buffers. Sockets,
//! correlation bookkeeping and logging live in the transport layer.

pub mod body;
pub mod codec;
pub mod context;
pub mod error;
pub mod frame;
pub mod header;
pub mod invocation;

pub use body::{BodyCodec, JsonCodec, Operation, OperationDescriptor, VoidCodec};
pub use codec::{
    decode_request, decode_request_bytes, decode_response, Decoder, Encoder, Response,
    ResponseBody, ResponseMeta,
};
pub use context::ContextMap;
pub use error::{BodyError, ErrorKind, ProtocolError};
pub use frame::{
    read_frame, read_frame_with_limit, write_frame, RawFrame, FRAME_PREFIX_SIZE, MAGIC,
};
pub use header::{HeaderFlags, ResponseStatus, WireHeader};
pub use invocation::Invocation;

/// Maximum total frame length (16 MiB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;
