//! Settlement handshake: agree on the transport entry over a fresh
//! connection and register it with transport discovery.
//!
//! The initiator sends its signed [`SignedEntry`] as a length-prefixed JSON
//! frame and waits for one response byte. The responder checks the entry
//! against what it derives from the same connection, countersigns it,
//! registers it and answers.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error};

use super::{Entry, Label, SignedEntry, TpdClient};
use crate::core::{TransportConn, read_prefixed, write_prefixed};
use crate::crypto::Keypair;

/// One-byte settlement responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SettlementResponse {
    /// The responder rejected the transport.
    Failure = 0,
    /// The transport is settled.
    Ok = 1,
    /// The responder could not sign the entry.
    SignatureError = 2,
    /// The entry did not match the connection.
    InvalidEntry = 3,
}

impl SettlementResponse {
    /// Parse a response byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Failure),
            1 => Some(Self::Ok),
            2 => Some(Self::SignatureError),
            3 => Some(Self::InvalidEntry),
            _ => None,
        }
    }
}

/// Settlement handshake errors.
#[derive(Debug, Error)]
pub enum SettlementError {
    /// The responder answered with failure.
    #[error("transport settlement rejected by remote")]
    Rejected,

    /// The responder found the entry invalid.
    #[error("invalid entry")]
    InvalidEntry,

    /// The responder reported a signature error.
    #[error("signature error")]
    SignatureError,

    /// The response byte is unknown.
    #[error("invalid remote response {0:#04x}")]
    InvalidResponse(u8),

    /// A received entry field differs from the expected one.
    #[error("received entry's '{0}' is not of expected")]
    Mismatch(&'static str),

    /// The remote signature is missing or wrong.
    #[error("invalid remote signature")]
    InvalidSignature,

    /// The handshake did not finish before its deadline.
    #[error("settlement handshake timed out")]
    Timeout,

    /// The entry could not be encoded or decoded.
    #[error("failed to read entry: {0}")]
    Encoding(#[from] serde_json::Error),

    /// I/O error on the connection.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl SettlementError {
    /// Whether settling over a fresh connection could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Io(_))
    }
}

/// Entry both edges derive from `conn`.
pub fn entry_from_conn(conn: &dyn TransportConn) -> Entry {
    Entry::new(
        conn.local_addr().pk,
        conn.remote_addr().pk,
        conn.network_type(),
        Label::User,
    )
}

fn compare_entries(expected: &Entry, received: &Entry) -> Result<(), SettlementError> {
    if expected.id != received.id {
        return Err(SettlementError::Mismatch("t_id"));
    }
    if expected.edges != received.edges {
        return Err(SettlementError::Mismatch("edges"));
    }
    if expected.network != received.network {
        return Err(SettlementError::Mismatch("type"));
    }
    if expected.public != received.public {
        return Err(SettlementError::Mismatch("public"));
    }
    Ok(())
}

async fn respond(conn: &dyn TransportConn, response: SettlementResponse) -> io::Result<()> {
    conn.write_all(&[response as u8]).await
}

/// Initiating side: send the signed entry and wait for the verdict.
pub async fn settle_initiator(conn: &dyn TransportConn, keys: &Keypair) -> Result<(), SettlementError> {
    let entry = entry_from_conn(conn);
    let se = SignedEntry::new(entry, keys).map_err(|_| SettlementError::SignatureError)?;
    write_prefixed(conn, &serde_json::to_vec(&se)?).await?;

    let mut response = [0u8; 1];
    conn.read_exact(&mut response).await?;
    match SettlementResponse::from_byte(response[0]) {
        Some(SettlementResponse::Ok) => Ok(()),
        Some(SettlementResponse::Failure) => Err(SettlementError::Rejected),
        Some(SettlementResponse::InvalidEntry) => Err(SettlementError::InvalidEntry),
        Some(SettlementResponse::SignatureError) => Err(SettlementError::SignatureError),
        None => Err(SettlementError::InvalidResponse(response[0])),
    }
}

/// Responding side: verify, countersign and register the entry.
///
/// A registration conflict means the entry is already known and is not an
/// error; other registration failures are logged and the handshake still
/// succeeds.
pub async fn settle_responder(
    conn: &dyn TransportConn,
    keys: &Keypair,
    tpd: &dyn TpdClient,
) -> Result<SignedEntry, SettlementError> {
    let expected = entry_from_conn(conn);
    let remote = conn.remote_addr().pk;

    let mut se = match receive_entry(conn, &expected).await {
        Ok(se) => se,
        Err(e) => {
            let _ = respond(conn, SettlementResponse::InvalidEntry).await;
            return Err(e);
        }
    };
    if !se.verify(&remote) {
        let _ = respond(conn, SettlementResponse::InvalidEntry).await;
        return Err(SettlementError::InvalidSignature);
    }
    if se.sign(keys).is_err() {
        let _ = respond(conn, SettlementResponse::SignatureError).await;
        return Err(SettlementError::SignatureError);
    }

    match tpd.register_transports(std::slice::from_ref(&se)).await {
        Ok(()) => debug!(tp_id = %se.entry.id, "Registered transport"),
        Err(e) if e.is_conflict() => {
            debug!(tp_id = %se.entry.id, "Transport was already registered")
        }
        Err(e) => error!(tp_id = %se.entry.id, error = %e, "Failed to register transport"),
    }

    respond(conn, SettlementResponse::Ok).await?;
    Ok(se)
}

async fn receive_entry(
    conn: &dyn TransportConn,
    expected: &Entry,
) -> Result<SignedEntry, SettlementError> {
    let frame = read_prefixed(conn).await?;
    let se: SignedEntry = serde_json::from_slice(&frame)?;
    compare_entries(expected, &se.entry)?;
    Ok(se)
}

/// Run `settle_initiator` under `deadline`.
pub async fn settle_initiator_within(
    conn: &dyn TransportConn,
    keys: &Keypair,
    deadline: Duration,
) -> Result<(), SettlementError> {
    tokio::time::timeout(deadline, settle_initiator(conn, keys))
        .await
        .unwrap_or(Err(SettlementError::Timeout))
}

/// Run `settle_responder` under `deadline`.
pub async fn settle_responder_within(
    conn: &dyn TransportConn,
    keys: &Keypair,
    tpd: &dyn TpdClient,
    deadline: Duration,
) -> Result<SignedEntry, SettlementError> {
    tokio::time::timeout(deadline, settle_responder(conn, keys, tpd))
        .await
        .unwrap_or(Err(SettlementError::Timeout))
}
