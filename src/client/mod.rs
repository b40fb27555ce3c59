//! Relay client: sessions with relay servers and the streams inside them.

#[allow(clippy::module_inception)]
mod client;
mod session;
mod stream;

pub use client::*;
pub use session::*;
pub use stream::*;
