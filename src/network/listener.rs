//! Listeners bound to a `(public key, port)` address.
//!
//! Network clients introduce freshly handshaked connections into the
//! listener bound at the destination port; callers pull them out with
//! [`Listener::accept`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::debug;

use crate::core::{ACCEPT_BUFFER_SIZE, Addr, Duplex, NetworkType, TransportConn};
use crate::porter::PortFreer;

/// Listener errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ListenerError {
    /// The listener has been closed.
    #[error("listener closed")]
    Closed,

    /// The accept queue is full.
    #[error("listener accept chan maxed")]
    AcceptQueueFull,
}

/// A listener yielding connections of type `C`.
pub struct Listener<C> {
    addr: Addr,
    network: NetworkType,
    tx: mpsc::Sender<Arc<C>>,
    rx: Mutex<mpsc::Receiver<Arc<C>>>,
    done: watch::Sender<bool>,
    closed: AtomicBool,
    freer: parking_lot::Mutex<Option<PortFreer>>,
}

impl<C: Duplex + 'static> Listener<C> {
    /// Create a listener with the default accept queue capacity.
    pub fn new(addr: Addr, network: NetworkType) -> Self {
        Self::with_capacity(addr, network, ACCEPT_BUFFER_SIZE)
    }

    /// Create a listener with an explicit accept queue capacity.
    pub fn with_capacity(addr: Addr, network: NetworkType, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let (done, _) = watch::channel(false);
        Self {
            addr,
            network,
            tx,
            rx: Mutex::new(rx),
            done,
            closed: AtomicBool::new(false),
            freer: parking_lot::Mutex::new(None),
        }
    }

    /// Attach the port reservation released when the listener closes.
    pub fn bind_freer(&self, freer: PortFreer) {
        *self.freer.lock() = Some(freer);
    }

    /// Address the listener is bound to.
    pub fn addr(&self) -> Addr {
        self.addr
    }

    /// Backend the listener belongs to.
    pub fn network(&self) -> NetworkType {
        self.network
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Hand a connection to whoever is accepting.
    pub fn introduce(&self, conn: Arc<C>) -> Result<(), ListenerError> {
        if self.is_closed() {
            return Err(ListenerError::Closed);
        }
        self.tx.try_send(conn).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ListenerError::AcceptQueueFull,
            mpsc::error::TrySendError::Closed(_) => ListenerError::Closed,
        })
    }

    /// Wait for the next connection.
    pub async fn accept(&self) -> Result<Arc<C>, ListenerError> {
        let mut done = self.done.subscribe();
        if *done.borrow() {
            return Err(ListenerError::Closed);
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            conn = rx.recv() => conn.ok_or(ListenerError::Closed),
            _ = done.wait_for(|closed| *closed) => Err(ListenerError::Closed),
        }
    }

    /// Close the listener, release its port, and close queued connections.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.done.send_replace(true);
        let freer = self.freer.lock().take();
        if let Some(freer) = freer {
            freer.free();
        }

        let mut rx = self.rx.lock().await;
        rx.close();
        while let Ok(conn) = rx.try_recv() {
            if let Err(e) = conn.close().await {
                debug!(addr = %self.addr, error = %e, "Failed to close queued connection");
            }
        }
    }
}

/// Object-safe view of a listener used by the transport manager.
#[async_trait]
pub trait TransportListener: Send + Sync {
    /// Wait for the next connection.
    async fn accept(&self) -> Result<Arc<dyn TransportConn>, ListenerError>;

    /// Address the listener is bound to.
    fn addr(&self) -> Addr;

    /// Close the listener.
    async fn close(&self);
}

#[async_trait]
impl<C: TransportConn + 'static> TransportListener for Listener<C> {
    async fn accept(&self) -> Result<Arc<dyn TransportConn>, ListenerError> {
        let conn = Listener::accept(self).await?;
        Ok(conn as Arc<dyn TransportConn>)
    }

    fn addr(&self) -> Addr {
        Listener::addr(self)
    }

    async fn close(&self) {
        Listener::close(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{MemoryDuplex, memory_pipe};
    use crate::crypto::Keypair;
    use crate::porter::Porter;

    fn listener(capacity: usize) -> Listener<MemoryDuplex> {
        let addr = Addr::new(Keypair::generate().pk(), 45);
        Listener::with_capacity(addr, NetworkType::Stcp, capacity)
    }

    #[tokio::test]
    async fn test_introduce_then_accept() {
        let l = listener(2);
        let (a, _b) = memory_pipe(8);
        l.introduce(Arc::new(a)).unwrap();
        assert!(l.accept().await.is_ok());
    }

    #[tokio::test]
    async fn test_accept_queue_full() {
        let l = listener(1);
        let (a, _) = memory_pipe(8);
        let (b, _) = memory_pipe(8);
        l.introduce(Arc::new(a)).unwrap();
        assert_eq!(
            l.introduce(Arc::new(b)).unwrap_err(),
            ListenerError::AcceptQueueFull
        );
    }

    #[tokio::test]
    async fn test_close_wakes_accept_and_frees_port() {
        let porter: Porter<()> = Porter::default();
        let l = Arc::new(listener(4));
        l.bind_freer(porter.reserve(45, ()).unwrap());

        let waiter = {
            let l = Arc::clone(&l);
            tokio::spawn(async move { l.accept().await })
        };
        tokio::task::yield_now().await;

        l.close().await;
        l.close().await;
        assert_eq!(waiter.await.unwrap().unwrap_err(), ListenerError::Closed);
        assert!(porter.port_value(45).is_none());

        let (a, _) = memory_pipe(8);
        assert_eq!(l.introduce(Arc::new(a)).unwrap_err(), ListenerError::Closed);
    }
}
