//! Transport layer errors.

use std::io;

use thiserror::Error;

use super::{PacketError, SettlementError};
use crate::core::NetworkType;
use crate::crypto::PubKey;
use crate::network::NetworkError;

/// Errors of a single managed transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport is closed or closing.
    #[error("transport is no longer being served")]
    NotServing,

    /// An underlying connection already exists and was kept.
    #[error("underlying transport already exists")]
    AlreadyExists,

    /// The connection runs over a different network than the transport.
    #[error("wrong network: transport is {expected}, connection is {got}")]
    WrongNetwork {
        /// Network of the managed transport.
        expected: NetworkType,
        /// Network of the offered connection.
        got: NetworkType,
    },

    /// No underlying connection is set up yet.
    #[error("transport is not set up")]
    NotSetUp,

    /// The key is not one of the entry's edges.
    #[error("edge index not found")]
    EdgeNotFound,

    /// The settlement handshake failed.
    #[error("settlement handshake failed: {0}")]
    Settlement(#[from] SettlementError),

    /// Dialing the remote failed.
    #[error("dial: {0}")]
    Network(#[from] NetworkError),

    /// A packet could not be read or written.
    #[error("packet: {0}")]
    Packet(#[from] PacketError),

    /// I/O error on the underlying connection.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether dialing again could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::NotServing | Self::Io(_) => true,
            Self::Network(e) => e.is_retryable(),
            Self::Settlement(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Errors of the transport manager.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The manager has been closed.
    #[error("transport manager is closed")]
    Closed,

    /// The manager stopped delivering packets.
    #[error("transport manager is no longer serving")]
    NotServing,

    /// No client is registered for the network.
    #[error("unknown network type {0}")]
    UnknownNetwork(NetworkType),

    /// No transport matches the lookup.
    #[error("transport not found")]
    NotFound,

    /// Establishing a transport failed.
    #[error("save transport to {remote} over {network}: {source}")]
    Save {
        /// Remote visor.
        remote: PubKey,
        /// Network the transport was dialed over.
        network: NetworkType,
        /// Root cause.
        #[source]
        source: TransportError,
    },

    /// A network client could not be started.
    #[error("network client: {0}")]
    Network(#[from] NetworkError),
}

impl ManagerError {
    /// Whether the remote has no known address.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound => true,
            Self::Save {
                source: TransportError::Network(e),
                ..
            } => e.is_not_found(),
            Self::Network(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Result alias for managed transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
