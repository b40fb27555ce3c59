//! Relay discovery: where clients are delegated and where servers listen.

mod client;
mod entry;
#[cfg(feature = "http")]
mod http;

pub use client::*;
pub use entry::*;
#[cfg(feature = "http")]
#[cfg_attr(docsrs, doc(cfg(feature = "http")))]
pub use http::*;
