//! # highway-transport
//!
//! Connection-side plumbing for the Highway RPC protocol.
//!
//! This crate provides:
//! - Framed peer connections over any async byte stream
//! - Correlation of responses to in-flight calls
//! - YAML/environment configuration
//!
//! Establishing, pooling and securing the underlying streams is left to the
//! embedding application.

pub mod config;
pub mod connection;
pub mod correlation;
pub mod error;

pub use config::{CodecConfig, Config, ConfigError, ConnectionConfig};
pub use connection::{Connection, IncomingRequest, ONE_WAY_CORRELATION_ID};
pub use correlation::CorrelationRegistry;
pub use error::TransportError;
