//! Port reservation table.
//!
//! Every network client owns a [`Porter`] that maps 16-bit ports to an
//! opaque value (typically the listener bound there) and hands out
//! ephemeral ports for outgoing connections.

#[allow(clippy::module_inception)]
mod porter;

pub use porter::*;
