//! Relay server: accepts client sessions and routes streams between them.

#[allow(clippy::module_inception)]
mod server;
mod session;

pub use server::*;
pub use session::*;
