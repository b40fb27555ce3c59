//! # Visor Transport
//!
//! The transport layer of a public-key addressed overlay mesh. Every visor is
//! identified by an Ed25519 public key and talks to other visors over
//! *transports*: settled, discoverable links over one of several networks.
//!
//! - **Relay (dmsg)**: multiplexed, flow-controlled streams through relay
//!   servers, addressed by `(public key, port)`
//! - **Direct**: TCP (`stcp`, `stcpr`) and KCP over UDP (`sudph`) with a
//!   signed address handshake and optional Noise encryption
//! - **Transports**: settlement with a transport discovery, re-homing of
//!   dropped connections, traffic logs
//! - **Manager**: one authority owning every transport of a visor
//!
//! ## Feature Flags
//!
//! - `http` (default): HTTP clients for the discovery services
//!
//! ## Modules
//!
//! - [`core`]: addresses, duplex traits, constants, and error types
//! - [`crypto`]: identities and Noise channels
//! - [`porter`]: port reservation
//! - [`relay`], [`client`], [`server`]: the relay protocol
//! - [`disc`]: relay discovery
//! - [`httpauth`]: nonce-authenticated HTTP
//! - [`network`]: network backends
//! - [`transport`]: managed transports and the transport manager
//! - [`config`]: serde configuration
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use visor_transport::prelude::*;
//!
//! # async fn run() -> Result<(), VisorError> {
//! let keys = Keypair::generate();
//! let config = TransportConfig::from_json(r#"{"networks": ["stcp"]}"#)?;
//! let factory = config.client_factory(keys, None, None);
//! let manager = config.build_manager(&factory).await?;
//! manager.serve();
//!
//! while let Ok(packet) = manager.read_packet().await {
//!     println!("route {} carried {} bytes", packet.route_id(), packet.size());
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core module (always included)
pub mod core;

pub mod crypto;
pub mod porter;

// Relay protocol
pub mod client;
pub mod relay;
pub mod server;

// Discovery collaborators
pub mod disc;
pub mod httpauth;

pub mod config;
pub mod network;
pub mod transport;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::core::*;
    pub use crate::crypto::{Keypair, PubKey, SecKey, Sig};

    pub use crate::client::{Client, ClientBuilder, Stream};
    pub use crate::server::{Server, ServerBuilder};

    pub use crate::config::{ConfigError, TransportConfig};
    pub use crate::network::{ClientFactory, NetworkClient, NetworkError};
    pub use crate::transport::{
        Label, ManagedTransport, Manager, ManagerBuilder, ManagerError, Packet, PacketType,
        TransportError,
    };
}

// Re-export commonly used items at crate root
pub use core::{Addr, NetworkType, VisorError};
pub use transport::{Manager, ManagerConfig};
