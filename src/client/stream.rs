//! Relay streams: flow-controlled virtual connections inside a session.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tracing::{debug, trace};

use super::session::ClientSession;
use crate::core::{Addr, Duplex, NetworkType, TransportConn, WindowError};
use crate::porter::PortFreer;
use crate::relay::{Frame, FrameType, LocalWindow, RemoteWindow, ack_chunks};

/// A virtual connection between two `(public key, port)` addresses,
/// multiplexed over a relay session.
pub struct Stream {
    id: u16,
    local: Addr,
    remote: Addr,
    lw: LocalWindow,
    rw: RemoteWindow,
    io: Arc<dyn Duplex>,
    session: Weak<ClientSession>,
    freer: parking_lot::Mutex<Option<PortFreer>>,
    closed: AtomicBool,
}

impl Stream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: u16,
        local: Addr,
        remote: Addr,
        local_window: usize,
        remote_window: usize,
        io: Arc<dyn Duplex>,
        session: Weak<ClientSession>,
        freer: Option<PortFreer>,
    ) -> Self {
        Self {
            id,
            local,
            remote,
            lw: LocalWindow::new(local_window),
            rw: RemoteWindow::new(remote_window),
            io,
            session,
            freer: parking_lot::Mutex::new(freer),
            closed: AtomicBool::new(false),
        }
    }

    /// Stream id within the session.
    pub fn id(&self) -> u16 {
        self.id
    }

    /// Public key of the relay server carrying the stream.
    pub fn server_pk(&self) -> Option<crate::crypto::PubKey> {
        self.session.upgrade().map(|s| s.server_pk())
    }

    /// Whether the stream has been closed by either side.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn on_fwd(&self, payload: &[u8]) -> Result<(), WindowError> {
        self.lw.enqueue(payload)
    }

    pub(crate) fn on_ack(&self, n: u16) -> Result<(), WindowError> {
        self.rw.grow(n as usize)
    }

    /// Tear the stream down after the peer closed it or the session died.
    pub(crate) fn close_remote(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.release();
    }

    fn release(&self) {
        self.lw.close();
        self.rw.close();
        if let Some(session) = self.session.upgrade() {
            session.remove_stream(self.id);
        }
        let freer = self.freer.lock().take();
        if let Some(freer) = freer {
            freer.free();
        }
        trace!(id = self.id, local = %self.local, remote = %self.remote, "Stream released");
    }
}

#[async_trait]
impl Duplex for Stream {
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.lw.read(buf).await?;
        if n > 0 && !self.is_closed() {
            for ack in ack_chunks(n) {
                if let Err(e) = Frame::ack(self.id, ack).write_to(self.io.as_ref()).await {
                    debug!(id = self.id, error = %e, "Failed to send ACK");
                    break;
                }
            }
        }
        Ok(n)
    }

    async fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let id = self.id;
        self.rw
            .write(buf, |chunk| {
                let io = Arc::clone(&self.io);
                async move {
                    Frame::new(FrameType::Fwd, id, chunk)
                        .write_to(io.as_ref())
                        .await
                        .map_err(io::Error::from)
                }
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.release();
        if let Err(e) = Frame::close(self.id).write_to(self.io.as_ref()).await {
            debug!(id = self.id, error = %e, "Failed to send CLOSE");
        }
        Ok(())
    }
}

impl TransportConn for Stream {
    fn local_addr(&self) -> Addr {
        self.local
    }

    fn remote_addr(&self) -> Addr {
        self.remote
    }

    fn network_type(&self) -> NetworkType {
        NetworkType::Dmsg
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("closed", &self.is_closed())
            .finish()
    }
}
