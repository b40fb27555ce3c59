//! Handshaked raw connections.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::debug;

use super::HandshakeError;
use crate::core::{Addr, Duplex, ENCRYPTION_HANDSHAKE_TIMEOUT, NetworkType, TransportConn};
use crate::crypto::{Keypair, initiate_kk, respond_kk};
use crate::porter::PortFreer;

/// A raw connection that completed the address handshake.
pub struct Conn {
    io: Arc<dyn Duplex>,
    local: Addr,
    remote: Addr,
    network: NetworkType,
    freer: parking_lot::Mutex<Option<PortFreer>>,
    closed: AtomicBool,
}

impl Conn {
    /// Wrap `io`, releasing `freer` when the connection closes.
    pub fn new(
        io: Arc<dyn Duplex>,
        local: Addr,
        remote: Addr,
        network: NetworkType,
        freer: Option<PortFreer>,
    ) -> Self {
        Self {
            io,
            local,
            remote,
            network,
            freer: parking_lot::Mutex::new(freer),
            closed: AtomicBool::new(false),
        }
    }

    /// Layer a `Noise_KK` channel keyed by both identities over the
    /// connection. On failure the raw connection is closed.
    pub async fn encrypt(mut self, keys: &Keypair, initiator: bool) -> Result<Self, HandshakeError> {
        let raw = Arc::clone(&self.io);
        let handshake = async {
            if initiator {
                initiate_kk(Arc::clone(&raw), keys, &self.remote.pk).await
            } else {
                respond_kk(Arc::clone(&raw), keys, &self.remote.pk).await
            }
        };
        let result = tokio::time::timeout(ENCRYPTION_HANDSHAKE_TIMEOUT, handshake).await;
        match result {
            Ok(Ok(noise)) => {
                self.io = Arc::new(noise);
                Ok(self)
            }
            Ok(Err(e)) => {
                let _ = self.close().await;
                Err(e.into())
            }
            Err(_) => {
                let _ = self.close().await;
                Err(HandshakeError::Timeout)
            }
        }
    }
}

#[async_trait]
impl Duplex for Conn {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.io.read(buf).await
    }

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        self.io.write_all(buf).await
    }

    async fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let freer = self.freer.lock().take();
        if let Some(freer) = freer {
            freer.free();
        }
        let result = self.io.close().await;
        if let Err(e) = &result {
            debug!(local = %self.local, remote = %self.remote, error = %e, "Failed to close connection");
        }
        result
    }
}

impl TransportConn for Conn {
    fn local_addr(&self) -> Addr {
        self.local
    }

    fn remote_addr(&self) -> Addr {
        self.remote
    }

    fn network_type(&self) -> NetworkType {
        self.network
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("network", &self.network)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::memory_pipe;
    use crate::porter::Porter;

    #[tokio::test]
    async fn test_encrypted_conn_round_trip() {
        let ka = Keypair::generate();
        let kb = Keypair::generate();
        let (a, b) = memory_pipe(64 * 1024);
        let addr_a = Addr::new(ka.pk(), 50000);
        let addr_b = Addr::new(kb.pk(), 45);

        let porter: Porter<()> = Porter::default();
        let freer = porter.reserve(50000, ()).unwrap();
        let ca = Conn::new(Arc::new(a), addr_a, addr_b, NetworkType::Stcp, Some(freer));
        let cb = Conn::new(Arc::new(b), addr_b, addr_a, NetworkType::Stcp, None);

        let (kb2, ka2) = (kb.clone(), ka.clone());
        let responder = tokio::spawn(async move { cb.encrypt(&kb2, false).await });
        let ca = ca.encrypt(&ka2, true).await.unwrap();
        let cb = responder.await.unwrap().unwrap();

        ca.write_all(b"sealed").await.unwrap();
        let mut buf = [0u8; 6];
        cb.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"sealed");

        ca.close().await.unwrap();
        ca.close().await.unwrap();
        assert!(porter.is_empty());
        assert!(ca.write_all(b"x").await.is_err());
    }
}
