//! Protocol constants for the visor transport layer.
//!
//! Wire-level values are fixed by the protocol and MUST NOT be changed.
//! Timeouts and intervals are defaults that configs may override.

use std::time::Duration;

// =============================================================================
// IDENTITY
// =============================================================================

/// Ed25519 public key size.
pub const PUBLIC_KEY_SIZE: usize = 32;

/// Ed25519 secret key size.
pub const SECRET_KEY_SIZE: usize = 32;

/// Ed25519 signature size.
pub const SIGNATURE_SIZE: usize = 64;

// =============================================================================
// PORTS
// =============================================================================

/// First port handed out by ephemeral reservation.
pub const MIN_EPHEMERAL_PORT: u16 = 49152;

/// Port every visor listens on for transports.
pub const TRANSPORT_PORT: u16 = 45;

// =============================================================================
// RELAY FRAMING
// =============================================================================

/// Relay frame header: type(1) + stream id(2) + payload length(2).
pub const RELAY_HEADER_LEN: usize = 5;

/// Maximum payload of a single FWD frame.
pub const MAX_FWD_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Version string carried in relay stream handshake data.
pub const RELAY_HANDSHAKE_VERSION: &str = "2.0";

/// Default advertised read window per relay stream (64 KiB).
pub const DEFAULT_WINDOW_SIZE: usize = 64 * 1024;

/// Capacity of a listener's accept queue.
pub const ACCEPT_BUFFER_SIZE: usize = 20;

// =============================================================================
// NOISE
// =============================================================================

/// Maximum Noise message length (ciphertext, excluding the length prefix).
pub const NOISE_MAX_MESSAGE_LEN: usize = 65535;

/// Poly1305 tag appended to each Noise transport message.
pub const NOISE_TAG_LEN: usize = 16;

/// Maximum plaintext carried by one Noise transport message.
pub const NOISE_MAX_PAYLOAD_LEN: usize = NOISE_MAX_MESSAGE_LEN - NOISE_TAG_LEN;

// =============================================================================
// TIMEOUTS
// =============================================================================

/// Relay session Noise handshake deadline.
pub const SESSION_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay stream REQUEST/ACCEPT deadline.
pub const STREAM_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Raw handshake (address negotiation) deadline.
pub const RAW_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Noise KK deadline layered on a raw connection.
pub const ENCRYPTION_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Settlement handshake deadline.
pub const SETTLEMENT_TIMEOUT: Duration = Duration::from_secs(20);

/// Physical dial deadline for relay servers.
pub const SESSION_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

// =============================================================================
// INTERVALS
// =============================================================================

/// Relay client serve loop wake-up interval.
pub const CLIENT_SERVE_WAIT: Duration = Duration::from_secs(1);

/// Default relay server discovery entry refresh interval.
pub const SERVER_UPDATE_INTERVAL: Duration = Duration::from_secs(30);

/// Managed transport log flush interval.
pub const LOG_FLUSH_INTERVAL: Duration = Duration::from_secs(3);

/// Manager cleanup interval.
pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(1);

/// Manager persistent transport reconnect interval.
pub const PERSISTENT_RECONNECT_INTERVAL: Duration = Duration::from_secs(10);

/// Per-attempt deadline when reconnecting a persistent transport.
pub const PERSISTENT_DIAL_TIMEOUT: Duration = Duration::from_secs(3);

/// How long an accepted transport waits for the dialing edge to re-home it.
pub const REHOME_GRACE: Duration = Duration::from_secs(10);

// =============================================================================
// QUEUES AND RETRIES
// =============================================================================

/// Capacity of the manager's shared inbound packet queue.
pub const READ_QUEUE_SIZE: usize = 20;

/// Attempts made when deregistering a transport from discovery.
pub const DEREGISTER_ATTEMPTS: u32 = 5;

/// Initial backoff between deregistration attempts.
pub const DEREGISTER_BACKOFF: Duration = Duration::from_millis(100);

/// Retries of `save_transport` on a transient not-serving condition.
pub const SAVE_TRANSPORT_RETRIES: usize = 3;

// =============================================================================
// KCP (sudph)
// =============================================================================

/// Maximum transmission unit of KCP segments.
pub const KCP_MTU: usize = 1400;

/// KCP send and receive window, in segments.
pub const KCP_WINDOW_SIZE: u16 = 256;
