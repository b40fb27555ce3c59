//! Error types shared across the visor transport layers.

use std::io;

use thiserror::Error;

/// Errors in the crypto layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Noise handshake failed.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// Noise encryption failed.
    #[error("encryption failed")]
    EncryptionFailed,

    /// Noise decryption failed (invalid tag or corrupted).
    #[error("decryption failed (invalid tag or corrupted)")]
    DecryptionFailed,

    /// Bytes do not encode a valid public key.
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Signature verification failed.
    #[error("invalid signature")]
    InvalidSignature,

    /// The key proven during the handshake differs from the claimed one.
    #[error("remote static key does not match claimed public key")]
    RemoteKeyMismatch,

    /// Handshake did not complete before its deadline.
    #[error("handshake timed out")]
    Timeout,

    /// I/O error on the underlying stream.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised by per-stream flow control windows.
#[derive(Debug, Error)]
pub enum WindowError {
    /// The peer sent more data than the advertised window allows.
    #[error("remote is not respecting advertised window size (remaining {remaining}, max {max})")]
    Violation {
        /// Remaining budget after applying the offending frame.
        remaining: i64,
        /// Advertised maximum.
        max: usize,
    },

    /// An acknowledgement grew the remote window past its maximum.
    #[error("remote window out of range (remaining {remaining}, max {max})")]
    OutOfRange {
        /// Remaining budget after applying the offending ack.
        remaining: i64,
        /// Advertised maximum.
        max: usize,
    },

    /// The window has been closed.
    #[error("window closed")]
    Closed,

    /// Sending a chunk failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl WindowError {
    /// Whether the error means the peer broke the flow-control contract.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Violation { .. } | Self::OutOfRange { .. })
    }
}

impl From<WindowError> for io::Error {
    fn from(err: WindowError) -> Self {
        match err {
            WindowError::Io(e) => e,
            WindowError::Closed => io::Error::new(io::ErrorKind::BrokenPipe, "window closed"),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Top-level visor transport errors.
#[derive(Debug, Error)]
pub enum VisorError {
    /// Crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Relay error.
    #[error("relay error: {0}")]
    Relay(#[from] crate::relay::RelayError),

    /// Network backend error.
    #[error("network error: {0}")]
    Network(#[from] crate::network::NetworkError),

    /// Transport error.
    #[error("transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    /// Manager error.
    #[error("manager error: {0}")]
    Manager(#[from] crate::transport::ManagerError),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_error_classification() {
        let violation = WindowError::Violation {
            remaining: -1,
            max: 10,
        };
        assert!(violation.is_protocol_violation());
        assert!(!WindowError::Closed.is_protocol_violation());
    }

    #[test]
    fn test_window_error_into_io() {
        let err: io::Error = WindowError::Closed.into();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);

        let err: io::Error = WindowError::OutOfRange {
            remaining: 11,
            max: 10,
        }
        .into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
