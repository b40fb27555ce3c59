//! Discovery entries published by relay clients and servers.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::CryptoError;
use crate::crypto::{PubKey, SecKey, Sig};

/// Entry format version.
pub const ENTRY_VERSION: &str = "0.0.1";

/// Errors returned by discovery clients.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// No entry exists for the public key.
    #[error("entry of public key is not found")]
    NotFound,

    /// The discovery knows no relay server with free sessions.
    #[error("no delegated dmsg servers available for remote")]
    NoAvailableServers,

    /// The entry signature was rejected.
    #[error("invalid signature")]
    Unauthorized,

    /// The request was malformed.
    #[error("error bad input")]
    BadInput,

    /// Sequence of the new entry is not the old sequence plus one.
    #[error("entry validation error: sequence field of new entry is not sequence of old entry + 1")]
    WrongSequence,

    /// A new entry did not start at sequence zero.
    #[error("entry validation error: new entry has non-zero sequence")]
    NonZeroSequence,

    /// Another entry validation failure.
    #[error("entry validation error: {0}")]
    Validation(String),

    /// The discovery could not be reached or answered unexpectedly.
    #[error("discovery unavailable: {0}")]
    Unavailable(String),

    /// Signing or verification failed.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// JSON encoding failed.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl DiscoveryError {
    /// Map a discovery error message back to its variant.
    pub fn from_message(msg: &str) -> Self {
        match msg {
            "entry of public key is not found" => Self::NotFound,
            "no delegated dmsg servers available for remote" => Self::NoAvailableServers,
            "invalid signature" => Self::Unauthorized,
            "error bad input" => Self::BadInput,
            m if m.contains("sequence of old entry + 1") => Self::WrongSequence,
            m if m.contains("non-zero sequence") => Self::NonZeroSequence,
            m => match m.strip_prefix("entry validation error: ") {
                Some(cause) => Self::Validation(cause.to_string()),
                None => Self::Unavailable(m.to_string()),
            },
        }
    }

    /// Whether retrying the same request later could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::NoAvailableServers)
    }
}

/// Client half of an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    /// Relay servers the client keeps sessions with.
    pub delegated_servers: Vec<PubKey>,
}

/// Server half of an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// TCP address clients dial.
    pub address: String,
    /// Sessions the server still accepts.
    #[serde(rename = "availableSessions")]
    pub available_sessions: i64,
}

/// A signed discovery entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscEntry {
    /// Entry format version.
    pub version: String,
    /// Incremented on every update.
    pub sequence: u64,
    /// Unix time of the last update, in nanoseconds.
    pub timestamp: i64,
    /// Owner of the entry.
    #[serde(rename = "static")]
    pub static_pk: PubKey,
    /// Set for relay clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientInfo>,
    /// Set for relay servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerInfo>,
    /// Signature over the entry with this field cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<Sig>,
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or_default()
}

impl DiscEntry {
    /// New unsigned client entry.
    pub fn new_client(pk: PubKey, sequence: u64, delegated_servers: Vec<PubKey>) -> Self {
        Self {
            version: ENTRY_VERSION.to_string(),
            sequence,
            timestamp: now_nanos(),
            static_pk: pk,
            client: Some(ClientInfo { delegated_servers }),
            server: None,
            signature: None,
        }
    }

    /// New unsigned server entry.
    pub fn new_server(pk: PubKey, sequence: u64, address: String, available_sessions: i64) -> Self {
        Self {
            version: ENTRY_VERSION.to_string(),
            sequence,
            timestamp: now_nanos(),
            static_pk: pk,
            client: None,
            server: Some(ServerInfo {
                address,
                available_sessions,
            }),
            signature: None,
        }
    }

    fn signing_bytes(&self) -> Result<Vec<u8>, DiscoveryError> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        Ok(serde_json::to_vec(&unsigned)?)
    }

    /// Sign the entry in place.
    pub fn sign(&mut self, sk: &SecKey) -> Result<(), DiscoveryError> {
        self.signature = None;
        let msg = self.signing_bytes()?;
        self.signature = Some(sk.sign(&msg));
        Ok(())
    }

    /// Check the signature against the entry's own key.
    pub fn verify_signature(&self) -> Result<(), DiscoveryError> {
        let sig = self.signature.ok_or(DiscoveryError::Unauthorized)?;
        self.static_pk
            .verify(&self.signing_bytes()?, &sig)
            .map_err(|_| DiscoveryError::Unauthorized)
    }

    /// Structural validation applied before an entry is stored.
    pub fn validate(&self) -> Result<(), DiscoveryError> {
        if self.version.is_empty() {
            return Err(DiscoveryError::Validation("entry has no version".into()));
        }
        if self.signature.is_none() {
            return Err(DiscoveryError::Validation("entry has no signature".into()));
        }
        if self.static_pk.is_null() {
            return Err(DiscoveryError::Validation("entry Keys is nil".into()));
        }
        if self.client.is_none() && self.server.is_none() {
            return Err(DiscoveryError::Validation(
                "entry has neither client or server field".into(),
            ));
        }
        if self.server.as_ref().is_some_and(|s| s.address.is_empty()) {
            return Err(DiscoveryError::Validation(
                "server address cannot be empty".into(),
            ));
        }
        Ok(())
    }

    /// Bump sequence and timestamp ahead of a re-publish.
    pub fn advance(&mut self) {
        self.sequence += 1;
        self.timestamp = now_nanos().max(self.timestamp + 1);
    }

    /// Delegated servers, empty for server entries.
    pub fn delegated_servers(&self) -> &[PubKey] {
        self.client
            .as_ref()
            .map(|c| c.delegated_servers.as_slice())
            .unwrap_or_default()
    }
}
