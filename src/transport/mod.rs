//! Transports between visors.
//!
//! A transport is a settled, discoverable link between two visors over one
//! network. This module provides:
//!
//! - **Entries**: [`Entry`], [`SignedEntry`] and deterministic transport IDs
//! - **Packets**: the [`Packet`] codec carried over every transport
//! - **Settlement**: the handshake that agrees on and registers an entry
//! - **Managed transports**: [`ManagedTransport`] with re-homing and traffic logs
//! - **The manager**: [`Manager`], which owns every transport of a visor
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            Routing                      │
//! ├─────────────────────────────────────────┤
//! │         Transport Manager               │  ← This module
//! │   settlement, packets, re-homing        │
//! ├─────────────────────────────────────────┤
//! │  Network clients (stcp, stcpr, sudph,   │
//! │  relay)                                 │
//! └─────────────────────────────────────────┘
//! ```

mod entry;
mod error;
mod log;
mod managed;
mod manager;
mod packet;
mod settlement;
mod tpd;

pub use entry::*;
pub use error::*;
pub use log::*;
pub use managed::*;
pub use manager::*;
pub use packet::*;
pub use settlement::*;
pub use tpd::*;
