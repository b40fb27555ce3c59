//! Errors of the nonce-authenticated HTTP client.

use thiserror::Error;

/// Message a service returns when the `SW-Nonce` header is stale.
pub const NONCE_MISMATCH_MESSAGE: &str = "SW-Nonce does not match";

/// Authenticated request errors.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The nonce endpoint answered with an error status.
    #[error("error getting current nonce: status {status}: {message}")]
    Nonce {
        /// HTTP status code.
        status: u16,
        /// Error message from the body.
        message: String,
    },

    /// The request was still rejected after refreshing the nonce.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The request could not be sent or its response not read.
    #[cfg(feature = "http")]
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// A body could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

impl AuthError {
    /// Whether retrying later could succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            #[cfg(feature = "http")]
            Self::Http(_) => true,
            Self::Nonce { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
