//! Network backend errors.

use std::io;

use thiserror::Error;

use super::{ListenerError, ResolverError};
use crate::core::{CryptoError, NetworkType};
use crate::crypto::PubKey;
use crate::porter::PorterError;
use crate::relay::RelayError;

/// Message a responder sends when no listener is bound at the requested port.
pub const NOT_LISTENING_MESSAGE: &str = "not listening on given port";

/// Errors of the raw address handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The responder refused the handshake.
    #[error("handshake rejected: {0}")]
    Rejected(String),

    /// The responder is not listening on the destination port.
    #[error("not listening on given port")]
    NotListening,

    /// The first frame was not the expected greeting.
    #[error("bad handshake message: {0:?}")]
    BadGreeting(String),

    /// The signed frame echoed a different nonce.
    #[error("unexpected nonce")]
    UnexpectedNonce,

    /// The signed frame was not signed by its source key.
    #[error("invalid frame signature")]
    InvalidSignature,

    /// The handshake did not finish before its deadline.
    #[error("handshake timed out")]
    Timeout,

    /// A frame could not be encoded or decoded.
    #[error("malformed handshake frame: {0}")]
    Encoding(#[from] serde_json::Error),

    /// The encryption handshake failed.
    #[error("encryption handshake failed: {0}")]
    Crypto(#[from] CryptoError),

    /// I/O error on the raw connection.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Errors of the network clients.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// No address is known for the remote key.
    #[error("no address known for {0}")]
    NotFound(PubKey),

    /// No client is configured for the network.
    #[error("network {0} is not configured")]
    UnknownNetwork(NetworkType),

    /// The port already has a listener.
    #[error("port {0} is already occupied")]
    PortOccupied(u16),

    /// The client is closed.
    #[error("network client closed")]
    Closed,

    /// The client has not started listening yet.
    #[error("network client is not listening")]
    NotListening,

    /// Dialing did not finish before its deadline.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// The raw handshake failed.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// Address resolution failed.
    #[error("address resolver: {0}")]
    Resolver(#[from] ResolverError),

    /// The relay client failed.
    #[error("relay: {0}")]
    Relay(#[from] RelayError),

    /// Listener error.
    #[error("listener: {0}")]
    Listener(#[from] ListenerError),

    /// No local port could be reserved.
    #[error(transparent)]
    Porter(#[from] PorterError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl NetworkError {
    /// Whether the remote has no known address. Retrying cannot help.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Resolver(e) => e.is_not_found(),
            Self::Relay(e) => matches!(
                e,
                RelayError::DiscEntryNotFound | RelayError::DiscEntryIsNotClient
            ),
            _ => false,
        }
    }

    /// Whether the same dial could succeed later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotFound(_)
            | Self::UnknownNetwork(_)
            | Self::PortOccupied(_)
            | Self::Closed => false,
            Self::Handshake(HandshakeError::NotListening) => false,
            Self::Handshake(HandshakeError::InvalidSignature | HandshakeError::UnexpectedNonce) => {
                false
            }
            Self::Resolver(e) => !e.is_not_found(),
            Self::Relay(e) => e.is_retryable(),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;

    #[test]
    fn test_not_found_is_not_retryable() {
        let err = NetworkError::NotFound(Keypair::generate().pk());
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_listening_message() {
        let err = NetworkError::from(HandshakeError::NotListening);
        assert_eq!(err.to_string(), "not listening on given port");
        assert!(!err.is_retryable());
        assert!(NetworkError::Timeout("dial").is_retryable());
    }
}
