//! Relay (dmsg) protocol building blocks.
//!
//! Frames, per-stream flow control windows, relay error codes and the
//! session bookkeeping shared by the relay [`Client`](crate::client::Client)
//! and [`Server`](crate::server::Server).

mod entity;
mod errors;
mod frame;
mod window;

pub use entity::*;
pub use errors::*;
pub use frame::*;
pub use window::*;
