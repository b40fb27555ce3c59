//! Network backends that carry transports.
//!
//! Every backend produces [`TransportConn`](crate::core::TransportConn)s
//! addressed by `(public key, port)`:
//!
//! - `stcp`: direct TCP, addresses from a static [`PkTable`]
//! - `stcpr`: direct TCP, addresses from an [`AddressResolver`]
//! - `sudph`: KCP over UDP, addresses from an [`AddressResolver`]
//! - `dmsg`: streams through relay servers, see [`crate::client`]
//!
//! Direct backends open a raw connection, run the signed address
//! [`handshake`] and optionally layer `Noise_KK` on top.

mod client;
mod conn;
mod dmsg;
mod error;
mod factory;
mod generic;
pub mod handshake;
mod kcp;
mod listener;
mod pktable;
mod resolver;
mod tcp;

pub use client::*;
pub use conn::*;
pub use error::*;
pub use factory::*;
pub use generic::*;
pub use kcp::*;
pub use listener::*;
pub use pktable::*;
pub use resolver::*;
pub use tcp::*;
