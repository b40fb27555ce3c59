//! The capability every network backend provides.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use super::{NetworkError, TransportListener};
use crate::core::{NetworkType, TransportConn};
use crate::crypto::PubKey;

/// A network backend able to dial and accept [`TransportConn`]s.
#[async_trait]
pub trait NetworkClient: Send + Sync {
    /// Dial `remote` at its `port`.
    async fn dial(&self, remote: PubKey, port: u16) -> Result<Arc<dyn TransportConn>, NetworkError>;

    /// Listen on `port`. Connections arrive once [`start`](Self::start) ran.
    async fn listen(&self, port: u16) -> Result<Arc<dyn TransportListener>, NetworkError>;

    /// Start accepting raw connections in the background.
    async fn start(&self) -> Result<(), NetworkError>;

    /// Stop accepting and close every listener. Dialed connections stay open.
    async fn close(&self);

    /// Socket address raw connections are accepted on, if any.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Local public key.
    fn pk(&self) -> PubKey;

    /// Backend this client dials over.
    fn network_type(&self) -> NetworkType;
}
