//! Body serialization bindings.
//!
//! The wire encoding of message bodies belongs to a schema-aware collaborator.
//! The codec only calls it through [`BodyCodec`], and an [`Operation`] groups
//! the request and response bindings resolved for one remote operation.

use crate::error::BodyError;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt;
use std::marker::PhantomData;

/// Converts a structured value to and from opaque body bytes.
pub trait BodyCodec<T> {
    fn serialize(&self, value: &T) -> Result<Bytes, BodyError>;

    fn deserialize(&self, body: &[u8]) -> Result<T, BodyError>;
}

/// A resolved operation: its qualified name plus argument and result codecs.
///
/// Resolution from a name to an `Operation` is done by a registry outside this
/// crate; the codec only borrows the result for one call.
pub trait Operation {
    type Args;
    type Output;

    /// Qualified operation name written into request headers.
    fn name(&self) -> &str;

    fn request_codec(&self) -> &dyn BodyCodec<Self::Args>;

    fn response_codec(&self) -> &dyn BodyCodec<Self::Output>;
}

/// JSON body codec backed by serde.
pub struct JsonCodec<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonCodec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("JsonCodec")
    }
}

impl<T: Serialize + DeserializeOwned> BodyCodec<T> for JsonCodec<T> {
    fn serialize(&self, value: &T) -> Result<Bytes, BodyError> {
        Ok(Bytes::from(serde_json::to_vec(value)?))
    }

    fn deserialize(&self, body: &[u8]) -> Result<T, BodyError> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Codec for operations without a payload. Encodes to zero bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct VoidCodec;

impl BodyCodec<()> for VoidCodec {
    fn serialize(&self, _value: &()) -> Result<Bytes, BodyError> {
        Ok(Bytes::new())
    }

    fn deserialize(&self, body: &[u8]) -> Result<(), BodyError> {
        if body.is_empty() {
            Ok(())
        } else {
            Err(BodyError::new(format!(
                "expected empty body, got {} bytes",
                body.len()
            )))
        }
    }
}

/// Owned operation binding.
pub struct OperationDescriptor<A, R> {
    name: String,
    request: Box<dyn BodyCodec<A> + Send + Sync>,
    response: Box<dyn BodyCodec<R> + Send + Sync>,
}

impl<A, R> OperationDescriptor<A, R> {
    pub fn new(
        name: impl Into<String>,
        request: impl BodyCodec<A> + Send + Sync + 'static,
        response: impl BodyCodec<R> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            request: Box::new(request),
            response: Box::new(response),
        }
    }
}

impl<A, R> OperationDescriptor<A, R>
where
    A: Serialize + DeserializeOwned + 'static,
    R: Serialize + DeserializeOwned + 'static,
{
    /// Binds both directions to JSON bodies.
    pub fn json(name: impl Into<String>) -> Self {
        Self::new(name, JsonCodec::<A>::new(), JsonCodec::<R>::new())
    }
}

impl<A, R> Operation for OperationDescriptor<A, R> {
    type Args = A;
    type Output = R;

    fn name(&self) -> &str {
        &self.name
    }

    fn request_codec(&self) -> &dyn BodyCodec<A> {
        self.request.as_ref()
    }

    fn response_codec(&self) -> &dyn BodyCodec<R> {
        self.response.as_ref()
    }
}

impl<A, R> fmt::Debug for OperationDescriptor<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationDescriptor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
