//! Protocol error types and error kinds.

use std::fmt;
use thiserror::Error;

/// Errors produced while framing, parsing headers or binding message bodies.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("protocol mismatch: expected magic 'HWY.RPC', got {0:?}")]
    ProtocolMismatch(Vec<u8>),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: u64, max: u32 },

    #[error("malformed header: {0}")]
    MalformedHeader(String),

    #[error("insufficient data: need {needed} more bytes")]
    InsufficientData { needed: usize },

    #[error("body serialization failed: {0}")]
    Serialization(#[source] BodyError),

    #[error("body deserialization failed: {0}")]
    Deserialization(#[source] BodyError),
}

impl ProtocolError {
    /// Classifies this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::ProtocolMismatch(_) => ErrorKind::ProtocolMismatch,
            ProtocolError::MalformedFrame(_) | ProtocolError::FrameTooLarge { .. } => {
                ErrorKind::MalformedFrame
            }
            ProtocolError::MalformedHeader(_) => ErrorKind::MalformedHeader,
            ProtocolError::InsufficientData { .. } => ErrorKind::InsufficientData,
            ProtocolError::Serialization(_) => ErrorKind::SerializationFailure,
            ProtocolError::Deserialization(_) => ErrorKind::DeserializationFailure,
        }
    }

    /// Returns whether the byte stream carrying this frame can no longer be
    /// trusted. The transport must tear the connection down.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ProtocolMismatch | ErrorKind::MalformedFrame | ErrorKind::MalformedHeader
        )
    }

    /// Returns whether the source simply needs more bytes.
    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, ProtocolError::InsufficientData { .. })
    }
}

/// Coarse error classification shared by every layer above the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Magic marker absent or wrong. Connection-fatal.
    ProtocolMismatch,
    /// Length fields inconsistent. Frame-fatal.
    MalformedFrame,
    /// Header bytes do not decode. Same severity as `MalformedFrame`.
    MalformedHeader,
    /// Not a real failure: buffer more bytes and retry.
    InsufficientData,
    /// Body serializer rejected the value. Call-fatal only.
    SerializationFailure,
    /// Body bytes do not match the schema. Call-fatal only.
    DeserializationFailure,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::ProtocolMismatch => write!(f, "PROTOCOL_MISMATCH"),
            ErrorKind::MalformedFrame => write!(f, "MALFORMED_FRAME"),
            ErrorKind::MalformedHeader => write!(f, "MALFORMED_HEADER"),
            ErrorKind::InsufficientData => write!(f, "INSUFFICIENT_DATA"),
            ErrorKind::SerializationFailure => write!(f, "SERIALIZATION_FAILURE"),
            ErrorKind::DeserializationFailure => write!(f, "DESERIALIZATION_FAILURE"),
        }
    }
}

/// Error raised by a body codec collaborator.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BodyError {
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl BodyError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<serde_json::Error> for BodyError {
    fn from(err: serde_json::Error) -> Self {
        Self::with_source(err.to_string(), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            ProtocolError::ProtocolMismatch(b"GET".to_vec()).kind(),
            ErrorKind::ProtocolMismatch
        );
        assert_eq!(
            ProtocolError::FrameTooLarge { size: 10, max: 5 }.kind(),
            ErrorKind::MalformedFrame
        );
        assert_eq!(
            ProtocolError::MalformedHeader("x".into()).kind(),
            ErrorKind::MalformedHeader
        );
        assert_eq!(
            ProtocolError::InsufficientData { needed: 3 }.kind(),
            ErrorKind::InsufficientData
        );
        assert_eq!(
            ProtocolError::Deserialization(BodyError::new("bad")).kind(),
            ErrorKind::DeserializationFailure
        );
    }

    #[test]
    fn test_connection_fatal() {
        assert!(ProtocolError::ProtocolMismatch(vec![]).is_connection_fatal());
        assert!(ProtocolError::MalformedFrame("x".into()).is_connection_fatal());
        assert!(ProtocolError::MalformedHeader("x".into()).is_connection_fatal());

        // Payload errors only fail the single call
        assert!(!ProtocolError::Serialization(BodyError::new("x")).is_connection_fatal());
        assert!(!ProtocolError::Deserialization(BodyError::new("x")).is_connection_fatal());
        assert!(!ProtocolError::InsufficientData { needed: 1 }.is_connection_fatal());
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::ProtocolMismatch(b"XX".to_vec());
        assert!(err.to_string().contains("magic"));

        let err = ProtocolError::FrameTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::InsufficientData { needed: 10 };
        assert!(err.to_string().contains("10"));

        let err = ProtocolError::Serialization(BodyError::new("schema mismatch"));
        assert!(err.to_string().contains("schema mismatch"));
    }

    #[test]
    fn test_body_error_from_json() {
        let json_err = serde_json::from_str::<u32>("\"nope\"").unwrap_err();
        let err = BodyError::from(json_err);
        assert!(err.source().is_some());
        assert!(!err.message().is_empty());
    }

    #[test]
    fn test_error_kind_display() {
        assert_eq!(ErrorKind::ProtocolMismatch.to_string(), "PROTOCOL_MISMATCH");
        assert_eq!(
            ErrorKind::DeserializationFailure.to_string(),
            "DESERIALIZATION_FAILURE"
        );
    }
}
