//! Security layer.
//!
//! Implements the cryptographic primitives of the visor transport:
//! - Ed25519 identities, signatures, and hex encodings
//! - Noise_XK handshakes for relay sessions
//! - Noise_KK handshakes for encrypted raw transports
//! - Length-prefixed encrypted duplex channels

mod keys;
mod noise;

pub use keys::*;
pub use noise::*;
