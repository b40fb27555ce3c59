//! Relay errors and their numeric codes.
//!
//! Codes are shared with remote peers: a CLOSE reason or a rejected dial
//! carries the code, and both sides map it back to the same variant.

use std::io;

use thiserror::Error;

use super::FrameError;
use crate::core::{CryptoError, WindowError};
use crate::disc::DiscoveryError;
use crate::network::ListenerError;
use crate::porter::PorterError;

/// Errors of the relay (dmsg) layer.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The local client or server has been closed.
    #[error("local entity closed")]
    EntityClosed,

    /// The session carrying the stream has been closed.
    #[error("session closed")]
    SessionClosed,

    /// None of the remote's delegated servers could be reached.
    #[error("cannot connect to delegated server")]
    CannotConnectToDelegated,

    /// Bytes followed the session handshake before any frame was expected.
    #[error("extra bytes received during session handshake")]
    SessionHandshakeExtraBytes,

    /// No discovery entry exists for the key.
    #[error("discovery entry is not found")]
    DiscEntryNotFound,

    /// The entry does not describe a server.
    #[error("discovery entry is not of server")]
    DiscEntryIsNotServer,

    /// The entry does not describe a client.
    #[error("discovery entry is not of client")]
    DiscEntryIsNotClient,

    /// The client entry lists no delegated servers.
    #[error("discovery client entry has no delegated servers")]
    DiscEntryHasNoDelegated,

    /// The responder has no listener on the requested port.
    #[error("request failed: no listener on port")]
    ReqNoListener,

    /// The relay server has no session with the responder.
    #[error("request failed: no session with remote")]
    ReqNoSession,

    /// The port is already reserved.
    #[error("port is already occupied")]
    PortOccupied,

    /// The listener's accept queue is full.
    #[error("listener accept chan maxed")]
    AcceptChanMaxed,

    /// Every stream id of the session is in use.
    #[error("no free stream id")]
    NoFreeStreamId,

    /// The peer broke the relay protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A handshake did not finish in time.
    #[error("{0} timed out")]
    Timeout(&'static str),

    /// Ephemeral port allocation failed.
    #[error("porter error: {0}")]
    Porter(#[from] PorterError),

    /// Flow control failure.
    #[error("window error: {0}")]
    Window(#[from] WindowError),

    /// Malformed frame.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// Session encryption failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Discovery lookup or update failed.
    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    /// I/O error on the physical connection.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl RelayError {
    /// Numeric code exchanged with peers, if the error has one.
    pub fn code(&self) -> Option<u8> {
        Some(match self {
            Self::EntityClosed => 10,
            Self::SessionClosed => 11,
            Self::CannotConnectToDelegated => 12,
            Self::SessionHandshakeExtraBytes => 13,
            Self::DiscEntryNotFound => 30,
            Self::DiscEntryIsNotServer => 31,
            Self::DiscEntryIsNotClient => 32,
            Self::DiscEntryHasNoDelegated => 33,
            Self::ReqNoListener => 56,
            Self::ReqNoSession => 57,
            Self::PortOccupied => 80,
            Self::AcceptChanMaxed => 81,
            _ => return None,
        })
    }

    /// Map a numeric code back to its error.
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            10 => Self::EntityClosed,
            11 => Self::SessionClosed,
            12 => Self::CannotConnectToDelegated,
            13 => Self::SessionHandshakeExtraBytes,
            30 => Self::DiscEntryNotFound,
            31 => Self::DiscEntryIsNotServer,
            32 => Self::DiscEntryIsNotClient,
            33 => Self::DiscEntryHasNoDelegated,
            56 => Self::ReqNoListener,
            57 => Self::ReqNoSession,
            80 => Self::PortOccupied,
            81 => Self::AcceptChanMaxed,
            _ => return None,
        })
    }

    /// Whether the same operation may succeed if retried later.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::SessionClosed
            | Self::CannotConnectToDelegated
            | Self::ReqNoSession
            | Self::AcceptChanMaxed
            | Self::Timeout(_)
            | Self::Io(_) => true,
            Self::Discovery(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether the peer broke the protocol.
    pub fn is_protocol_violation(&self) -> bool {
        match self {
            Self::Protocol(_) | Self::SessionHandshakeExtraBytes => true,
            Self::Window(e) => e.is_protocol_violation(),
            _ => false,
        }
    }
}

impl From<ListenerError> for RelayError {
    fn from(err: ListenerError) -> Self {
        match err {
            ListenerError::Closed => Self::EntityClosed,
            ListenerError::AcceptQueueFull => Self::AcceptChanMaxed,
        }
    }
}

impl From<RelayError> for io::Error {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Io(e) => e,
            RelayError::Window(e) => e.into(),
            other => io::Error::other(other),
        }
    }
}
