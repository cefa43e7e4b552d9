//! Error types for the session engine.
//!
//! Command parsing never fails with an error: bad input becomes
//! [`crate::command::CommandIntent::Unknown`] or `NotACommand`.

use thiserror::Error;

/// A required piece of configuration is missing or unusable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("no hostname configured")]
    MissingHostname,
    #[error("no nickname configured")]
    MissingNickname,
    #[error("port must be non-zero")]
    InvalidPort,
    #[error("SASL username set without a SASL password")]
    MissingSaslPassword,
    #[error("proxy enabled without a proxy host")]
    MissingProxyHost,
}

/// Network or authentication failure reported by a transport.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("proxy error: {0}")]
    Proxy(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("transport closed")]
    Closed,
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// Errors returned by the public [`crate::session::ConnectionSession`] API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("not connected")]
    NotConnected,
    #[error("a connection is already active")]
    AlreadyActive,
    #[error("session worker has shut down")]
    Closed,
}

/// A single inbound event could not be reduced.
///
/// The event is dropped and the session state stays as it was before it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReduceError {
    #[error("malformed {event} event: {reason}")]
    Malformed {
        event: &'static str,
        reason: &'static str,
    },
    #[error("reducer panicked while handling {0}")]
    Panicked(&'static str),
}
