//! Error types shared by the whole runtime.

use std::io;
use thiserror::Error;

/// Main error type for Driveshaft operations.
#[derive(Error, Debug)]
pub enum DriveshaftError {
    /// IO error during socket operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Wire-protocol violation (bad greeting, bad framing, bad handshake)
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Endpoint string failed to parse
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Endpoint parsed but names a transport this build does not carry
    #[error("transport not supported: {0}")]
    UnsupportedTransport(String),

    /// Bad option value or misuse of the API
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not available on this socket pattern
    #[error("operation not supported by this socket type")]
    Unsupported,

    /// The socket pattern forbids this operation right now (e.g. a REQ
    /// socket sending twice without an intervening reply)
    #[error("operation cannot be performed in this state: {0}")]
    InvalidState(&'static str),

    /// Non-blocking operation could not complete, or a timeout expired.
    /// Distinct from real failures: the operation may be retried.
    #[error("operation would block")]
    WouldBlock,

    /// The owning context is shutting down; the socket is unusable
    #[error("context terminated")]
    Terminated,

    /// Another socket already occupies the endpoint
    #[error("address in use: {0}")]
    AddrInUse(String),

    /// ROUTER mandatory mode: no route to the requested peer
    #[error("peer unreachable")]
    HostUnreachable,

    /// Inbound frame exceeds the configured maximum message size
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type alias for Driveshaft operations.
pub type Result<T> = std::result::Result<T, DriveshaftError>;

impl DriveshaftError {
    /// Create a protocol error with a message.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an invalid-argument error with a message.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// True for [`DriveshaftError::WouldBlock`].
    #[must_use]
    pub const fn is_would_block(&self) -> bool {
        matches!(self, Self::WouldBlock)
    }

    /// True once the owning context has been terminated.
    #[must_use]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated)
    }

    /// Check if the underlying condition is transient (`EAGAIN`,
    /// `EINTR`) and the operation can be retried as-is.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::WouldBlock => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_would_block_is_transient() {
        assert!(DriveshaftError::WouldBlock.is_transient());
        assert!(DriveshaftError::Io(io::Error::from(io::ErrorKind::Interrupted)).is_transient());
        assert!(!DriveshaftError::Terminated.is_transient());
    }

    #[test]
    fn test_display() {
        let err = DriveshaftError::MessageTooLarge { size: 10, max: 5 };
        assert_eq!(err.to_string(), "message too large: 10 bytes (max: 5)");
    }
}
