//! # Error Types
//!
//! Error handling for the protocol engine.
//!
//! Every failure that crosses the engine boundary is a [`ProtocolError`]. Callers of
//! `submit` can match on [`ProtocolError::kind`] to tell a timeout from a closed
//! connection or a decode failure.
//!
//! ## Error Categories
//! - **Encoding Errors**: malformed tag-value data, missing required fields
//! - **Cryptographic Errors**: bodies that cannot be opened under the assumed key
//! - **Request Errors**: timeouts after bounded retry, duplicate in-flight keys
//! - **Connection Errors**: closed links, failed state transitions, handshake failures
//! - **I/O Errors**: network and cache file failures
//!
//! ## Propagation
//! Errors for a single incoming packet stay local: the packet is dropped and logged, the
//! rest of the stream is unaffected. Request and state errors surface to whoever awaits
//! that outcome.
//!
//! ## Example Usage
//! ```rust
//! use im_protocol_engine::error::{ErrorKind, ProtocolError};
//!
//! fn describe(err: &ProtocolError) -> &'static str {
//!     match err.kind() {
//!         ErrorKind::Timeout => "server did not answer",
//!         ErrorKind::ConnectionClosed => "connection went away",
//!         ErrorKind::Decode => "response could not be decoded",
//!         _ => "other failure",
//!     }
//! }
//!
//! assert_eq!(describe(&ProtocolError::ConnectionClosed), "connection went away");
//! ```

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Error message constants to reduce allocations in error paths.
pub mod constants {
    /// Registry errors
    pub const ERR_REGISTRY_WRITE_LOCK: &str = "Failed to acquire write lock on packet registry";
    pub const ERR_REGISTRY_READ_LOCK: &str = "Failed to acquire read lock on packet registry";

    /// Codec errors
    pub const ERR_TRUNCATED: &str = "Unexpected end of input";
    pub const ERR_NEGATIVE_LENGTH: &str = "Negative length";
    pub const ERR_INVALID_UTF8: &str = "String is not valid UTF-8";
    pub const ERR_DEPTH_EXCEEDED: &str = "Nesting depth exceeded";
    pub const ERR_INVALID_BOOL: &str = "Boolean byte must be 0 or 1";

    /// Framing errors
    pub const ERR_FRAME_LENGTH: &str = "Declared frame length out of range";

    /// Connection errors
    pub const ERR_CONNECTION_CLOSED: &str = "Connection closed";
    pub const ERR_NO_SERVERS: &str = "No server address available";
    pub const ERR_NOT_ACTIVE: &str = "Connection is not active";
    pub const ERR_SHUTDOWN: &str = "Engine has been shut down";
    pub const ERR_RESUME_CANCELLED: &str = "Resume cancelled while connecting";

    /// Handshake errors
    pub const ERR_SYSTEM_TIME: &str = "System time error: time went backwards";
    pub const ERR_INVALID_TIMESTAMP: &str = "Invalid or stale timestamp";
    pub const ERR_NONCE_VERIFICATION_FAILED: &str = "Server failed to prove the client nonce";
    pub const ERR_INVALID_PUBLIC_KEY: &str = "Public key must be 32 bytes";
    pub const ERR_UNEXPECTED_EXCHANGE: &str = "Unexpected key exchange payload";
}

/// Coarse classification of [`ProtocolError`] for callers that only need to branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Decode,
    Decryption,
    Timeout,
    ConnectionClosed,
    StateTransition,
    Handshake,
    Io,
    Config,
    Other,
}

/// ProtocolError is the primary error type for all engine operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Malformed encoding: {0}")]
    MalformedEncoding(String),

    #[error("Missing required field with tag {tag}")]
    MissingField { tag: u8 },

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error(
        "Request {command}#{sequence_id} timed out after {attempts} attempt(s) of {timeout:?}"
    )]
    Timeout {
        command: String,
        sequence_id: i32,
        attempts: u32,
        timeout: Duration,
        /// Errors of the earlier attempts, oldest first
        suppressed: Vec<ProtocolError>,
    },

    #[error("Operation timed out")]
    OperationTimeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("State transition failed: {0}")]
    StateTransition(String),

    #[error("Handshake failed: {0}")]
    HandshakeError(String),

    #[error("Invalid protocol header")]
    InvalidHeader,

    #[error("Unsupported protocol version: {0:#04x}")]
    UnsupportedVersion(u8),

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Request {command}#{sequence_id} is already in flight")]
    DuplicateRequest { command: String, sequence_id: i32 },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl ProtocolError {
    /// Classify this error for matching at the engine boundary
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedEncoding(_)
            | Self::MissingField { .. }
            | Self::InvalidHeader
            | Self::UnsupportedVersion(_)
            | Self::OversizedPacket(_)
            | Self::DecompressionFailure
            | Self::Serialization(_) => ErrorKind::Decode,
            Self::DecryptionFailure | Self::EncryptionFailure => ErrorKind::Decryption,
            Self::Timeout { .. } | Self::OperationTimeout => ErrorKind::Timeout,
            Self::ConnectionClosed => ErrorKind::ConnectionClosed,
            Self::StateTransition(_) => ErrorKind::StateTransition,
            Self::HandshakeError(_) => ErrorKind::Handshake,
            Self::Io(_) => ErrorKind::Io,
            Self::ConfigError(_) => ErrorKind::Config,
            Self::CompressionFailure | Self::DuplicateRequest { .. } | Self::Custom(_) => {
                ErrorKind::Other
            }
        }
    }

    /// Shorthand for a static malformed-encoding message
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedEncoding(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(ProtocolError::MissingField { tag: 3 }.kind(), ErrorKind::Decode);
        assert_eq!(ProtocolError::DecryptionFailure.kind(), ErrorKind::Decryption);
        assert_eq!(ProtocolError::ConnectionClosed.kind(), ErrorKind::ConnectionClosed);

        let timeout = ProtocolError::Timeout {
            command: "Heartbeat.Alive".into(),
            sequence_id: 7,
            attempts: 2,
            timeout: Duration::from_millis(10),
            suppressed: vec![ProtocolError::OperationTimeout],
        };
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert!(timeout.to_string().contains("Heartbeat.Alive#7"));
    }
}
