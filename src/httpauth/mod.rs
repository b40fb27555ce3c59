//! Nonce-authenticated HTTP requests used by the transport discovery and
//! address resolver clients.

mod error;

#[cfg(feature = "http")]
mod client;

pub use error::*;

#[cfg(feature = "http")]
#[cfg_attr(docsrs, doc(cfg(feature = "http")))]
pub use client::*;
