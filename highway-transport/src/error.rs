//! Transport error types.

use highway_protocol::ProtocolError;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timeout")]
    Timeout,

    #[error("too many pending calls (max {max})")]
    TooManyPendingCalls { max: usize },

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl TransportError {
    /// Returns whether the connection this error came from must be torn down.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            TransportError::Io(_) | TransportError::ConnectionClosed => true,
            TransportError::Protocol(e) => e.is_connection_fatal(),
            _ => false,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Io(_)
                | TransportError::Timeout
                | TransportError::ConnectionClosed
                | TransportError::TooManyPendingCalls { .. }
        )
    }
}
