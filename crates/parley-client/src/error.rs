//! Error types for the chat client.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` outside tests.

use std::io;
use thiserror::Error;

use parley_protocol::CodecError;

/// Client errors.
#[derive(Error, Debug)]
pub enum ClientError {
    /// Could not reach the relay.
    #[error("Failed to connect to relay: {0}")]
    Connection(String),

    /// The relay refused the handshake (bad name or room, full, ...).
    ///
    /// Retrying with the same parameters will fail the same way.
    #[error("Relay rejected the connection: {0}")]
    Rejected(String),

    /// Client and relay speak incompatible protocol versions.
    #[error("Protocol version mismatch (client: {client_version}, relay: {server_version})")]
    VersionMismatch {
        client_version: String,
        server_version: String,
    },

    /// The relay sent something out of sequence.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// I/O error passthrough.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A line could not be framed or parsed.
    #[error("Failed to parse message: {0}")]
    Codec(#[from] CodecError),
}

impl ClientError {
    /// Returns true if reconnecting cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::VersionMismatch { .. })
    }
}

/// Convenience Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_is_fatal() {
        assert!(ClientError::Rejected("room must not be blank".into()).is_fatal());
        assert!(ClientError::VersionMismatch {
            client_version: "1.0".into(),
            server_version: "2.0".into(),
        }
        .is_fatal());
    }

    #[test]
    fn test_io_is_not_fatal() {
        let err = ClientError::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("reset"));
    }
}
