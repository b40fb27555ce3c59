//! Direct-connection network clients: `stcp`, `stcpr` and `sudph`.
//!
//! All three share the same logic: open a raw connection, run the address
//! handshake, optionally encrypt, and hand accepted connections to the
//! listener bound at the destination port. They differ only in how a
//! remote key is turned into a socket address and in the raw transport.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::handshake::{self, Frame2};
use super::{
    AddressResolver, Conn, HandshakeError, KcpAcceptor, KcpDuplex, Listener, LocalAddresses,
    NetworkClient, NetworkError, PkTable, TcpDuplex, TransportListener,
};
use crate::core::{Addr, Duplex, NetworkType, RAW_HANDSHAKE_TIMEOUT, SESSION_DIAL_TIMEOUT, TransportConn};
use crate::crypto::{Keypair, PubKey};
use crate::porter::Porter;

/// How a backend finds remote visors.
#[derive(Clone)]
pub enum Backend {
    /// Direct TCP to addresses from a static table.
    Stcp(PkTable),
    /// Direct TCP to addresses from an address resolver.
    Stcpr(Arc<dyn AddressResolver>),
    /// KCP over UDP to addresses from an address resolver.
    Sudph(Arc<dyn AddressResolver>),
}

impl Backend {
    /// Network type the backend implements.
    pub fn network_type(&self) -> NetworkType {
        match self {
            Self::Stcp(_) => NetworkType::Stcp,
            Self::Stcpr(_) => NetworkType::Stcpr,
            Self::Sudph(_) => NetworkType::Sudph,
        }
    }
}

/// Configuration of a [`GenericClient`].
#[derive(Debug, Clone)]
pub struct GenericClientConfig {
    /// Socket address raw connections are accepted on.
    pub listen_addr: String,

    /// Whether to layer `Noise_KK` over every connection.
    pub encrypt: bool,

    /// Deadline for opening the raw connection.
    pub dial_timeout: Duration,
}

impl Default for GenericClientConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".to_string(),
            encrypt: true,
            dial_timeout: SESSION_DIAL_TIMEOUT,
        }
    }
}

/// Builder for [`GenericClientConfig`].
#[derive(Debug, Default)]
pub struct GenericClientBuilder {
    config: GenericClientConfig,
}

impl GenericClientBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listening socket address.
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Enable or disable encryption.
    pub fn encrypt(mut self, encrypt: bool) -> Self {
        self.config.encrypt = encrypt;
        self
    }

    /// Set the raw dial deadline.
    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.config.dial_timeout = timeout;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> GenericClientConfig {
        self.config
    }
}

#[derive(Clone)]
enum Bound {
    Listener(Arc<Listener<Conn>>),
    Dialed(Addr),
}

enum RawListener {
    Tcp(TcpListener),
    Kcp(KcpAcceptor),
}

impl RawListener {
    async fn accept(&self) -> io::Result<(Arc<dyn Duplex>, SocketAddr)> {
        match self {
            Self::Tcp(l) => {
                let (stream, peer) = l.accept().await?;
                Ok((Arc::new(TcpDuplex::new(stream)?), peer))
            }
            Self::Kcp(l) => {
                let conn = l.accept().await?;
                let peer = conn.peer_addr();
                Ok((Arc::new(conn), peer))
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        match self {
            Self::Tcp(l) => l.local_addr(),
            Self::Kcp(l) => Ok(l.local_addr()),
        }
    }
}

struct GenericInner {
    keys: Keypair,
    backend: Backend,
    config: GenericClientConfig,
    porter: Porter<Bound>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
    started: AtomicBool,
    done: watch::Sender<bool>,
    closed: AtomicBool,
}

/// A network client over direct connections.
#[derive(Clone)]
pub struct GenericClient {
    inner: Arc<GenericInner>,
}

impl GenericClient {
    /// Create a client for `backend`.
    pub fn new(keys: Keypair, backend: Backend, config: GenericClientConfig) -> Self {
        Self {
            inner: Arc::new(GenericInner {
                keys,
                backend,
                config,
                porter: Porter::default(),
                local_addr: parking_lot::Mutex::new(None),
                started: AtomicBool::new(false),
                done: watch::channel(false).0,
                closed: AtomicBool::new(false),
            }),
        }
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl GenericInner {
    fn network(&self) -> NetworkType {
        self.backend.network_type()
    }

    async fn connect(&self, addr: &str) -> Result<Arc<dyn Duplex>, NetworkError> {
        let timeout = self.config.dial_timeout;
        let io: Arc<dyn Duplex> = match self.backend {
            Backend::Sudph(_) => Arc::new(
                tokio::time::timeout(timeout, KcpDuplex::connect(addr))
                    .await
                    .map_err(|_| NetworkError::Timeout("dial"))??,
            ),
            _ => Arc::new(
                tokio::time::timeout(timeout, TcpDuplex::connect(addr))
                    .await
                    .map_err(|_| NetworkError::Timeout("dial"))??,
            ),
        };
        Ok(io)
    }

    async fn dial_raw(&self, remote: &PubKey) -> Result<Arc<dyn Duplex>, NetworkError> {
        let candidates = match &self.backend {
            Backend::Stcp(table) => {
                let addr = table.addr(remote).ok_or(NetworkError::NotFound(*remote))?;
                vec![addr.to_string()]
            }
            Backend::Stcpr(resolver) | Backend::Sudph(resolver) => {
                let data = resolver.resolve(self.network(), remote).await?;
                debug!(remote = %remote, data = ?data, "Resolved visor address");
                data.candidates()
            }
        };

        let mut last = NetworkError::NotFound(*remote);
        for addr in candidates {
            match self.connect(&addr).await {
                Ok(io) => return Ok(io),
                Err(e) => {
                    debug!(remote = %remote, addr = %addr, error = %e, "Raw dial failed");
                    last = e;
                }
            }
        }
        Err(last)
    }

    async fn init_transport(
        &self,
        io: Arc<dyn Duplex>,
        remote: PubKey,
        port: u16,
    ) -> Result<Arc<Conn>, NetworkError> {
        let remote = Addr::new(remote, port);
        let (local_port, freer) = match self.porter.reserve_ephemeral(Bound::Dialed(remote)) {
            Ok(reserved) => reserved,
            Err(e) => {
                let _ = io.close().await;
                return Err(e.into());
            }
        };
        let local = Addr::new(self.keys.pk(), local_port);

        let result = tokio::time::timeout(
            RAW_HANDSHAKE_TIMEOUT,
            handshake::initiate(io.as_ref(), &self.keys, local, remote),
        )
        .await
        .unwrap_or(Err(HandshakeError::Timeout));
        if let Err(e) = result {
            let _ = io.close().await;
            return Err(e.into());
        }
        debug!(network = %self.network(), local = %local, remote = %remote, "Dialed transport");

        let mut conn = Conn::new(io, local, remote, self.network(), Some(freer));
        if self.config.encrypt {
            conn = conn.encrypt(&self.keys, true).await?;
        }
        Ok(Arc::new(conn))
    }

    fn check_frame(&self, f2: &Frame2) -> Result<(), HandshakeError> {
        if f2.dst_addr.pk != self.keys.pk() {
            return Err(HandshakeError::Rejected(format!(
                "destination key {} is not ours",
                f2.dst_addr.pk
            )));
        }
        match self.porter.port_value(f2.dst_addr.port) {
            Some(Bound::Listener(_)) => Ok(()),
            _ => Err(HandshakeError::NotListening),
        }
    }

    async fn accept_transport(&self, io: Arc<dyn Duplex>) -> Result<(), NetworkError> {
        let result = tokio::time::timeout(
            RAW_HANDSHAKE_TIMEOUT,
            handshake::respond(io.as_ref(), |f2| self.check_frame(f2)),
        )
        .await
        .unwrap_or(Err(HandshakeError::Timeout));
        let (local, remote) = match result {
            Ok(addrs) => addrs,
            Err(e) => {
                let _ = io.close().await;
                return Err(e.into());
            }
        };

        let mut conn = Conn::new(io, local, remote, self.network(), None);
        if self.config.encrypt {
            conn = conn.encrypt(&self.keys, false).await?;
        }
        let conn = Arc::new(conn);

        let Some(Bound::Listener(listener)) = self.porter.port_value(local.port) else {
            let _ = conn.close().await;
            return Err(HandshakeError::NotListening.into());
        };
        if let Err(e) = listener.introduce(Arc::clone(&conn)) {
            let _ = conn.close().await;
            return Err(e.into());
        }
        debug!(network = %self.network(), local = %local, remote = %remote, "Accepted transport");
        Ok(())
    }

    async fn accept_loop(self: Arc<Self>, listener: RawListener) {
        let mut done = self.done.subscribe();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = done.wait_for(|d| *d) => break,
            };
            let (io, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    if self.closed.load(Ordering::Acquire) {
                        break;
                    }
                    warn!(network = %self.network(), error = %e, "Failed to accept raw connection");
                    continue;
                }
            };
            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = inner.accept_transport(io).await {
                    debug!(network = %inner.network(), peer = %peer, error = %e, "Incoming transport failed");
                }
            });
        }
        if let RawListener::Kcp(l) = &listener {
            l.close();
        }
        debug!(network = %self.network(), "Stopped accepting raw connections");
    }
}

#[async_trait]
impl NetworkClient for GenericClient {
    async fn dial(&self, remote: PubKey, port: u16) -> Result<Arc<dyn TransportConn>, NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        let io = self.inner.dial_raw(&remote).await?;
        let conn = self.inner.init_transport(io, remote, port).await?;
        Ok(conn as Arc<dyn TransportConn>)
    }

    async fn listen(&self, port: u16) -> Result<Arc<dyn TransportListener>, NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        let addr = Addr::new(self.inner.keys.pk(), port);
        let listener = Arc::new(Listener::new(addr, self.inner.network()));
        let freer = self
            .inner
            .porter
            .reserve(port, Bound::Listener(Arc::clone(&listener)))
            .ok_or(NetworkError::PortOccupied(port))?;
        listener.bind_freer(freer);
        Ok(listener as Arc<dyn TransportListener>)
    }

    async fn start(&self) -> Result<(), NetworkError> {
        if self.is_closed() {
            return Err(NetworkError::Closed);
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let listen_addr = &self.inner.config.listen_addr;
        let listener = match self.inner.backend {
            Backend::Sudph(_) => RawListener::Kcp(KcpAcceptor::bind(listen_addr).await?),
            _ => RawListener::Tcp(TcpListener::bind(listen_addr).await?),
        };
        let local = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(local);

        if let Backend::Stcpr(resolver) | Backend::Sudph(resolver) = &self.inner.backend {
            let addresses = if local.ip().is_unspecified() {
                Vec::new()
            } else {
                vec![local.ip().to_string()]
            };
            let bind = LocalAddresses {
                port: local.port().to_string(),
                addresses,
            };
            resolver
                .bind(self.inner.network(), &self.inner.keys.pk(), bind)
                .await?;
        }

        info!(network = %self.inner.network(), addr = %local, "Accepting raw connections");
        tokio::spawn(Arc::clone(&self.inner).accept_loop(listener));
        Ok(())
    }

    async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.done.send_replace(true);
        for (_, bound) in self.inner.porter.close_all() {
            if let Bound::Listener(listener) = bound {
                listener.close().await;
            }
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    fn pk(&self) -> PubKey {
        self.inner.keys.pk()
    }

    fn network_type(&self) -> NetworkType {
        self.inner.network()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::MemoryResolver;

    fn config() -> GenericClientConfig {
        GenericClientBuilder::new().listen_addr("127.0.0.1:0").build()
    }

    async fn exchange(a: &dyn NetworkClient, b: &dyn NetworkClient) {
        let listener = b.listen(45).await.unwrap();
        let conn = a.dial(b.pk(), 45).await.unwrap();
        let accepted = listener.accept().await.unwrap();

        assert_eq!(conn.remote_addr(), Addr::new(b.pk(), 45));
        assert_eq!(accepted.remote_addr(), conn.local_addr());
        assert_eq!(accepted.network_type(), a.network_type());

        conn.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        accepted.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        accepted.write_all(b"pong").await.unwrap();
        conn.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_stcp_dial_and_accept() {
        let kb = Keypair::generate();
        let b = GenericClient::new(kb.clone(), Backend::Stcp(PkTable::default()), config());
        b.start().await.unwrap();
        let b_addr = b.local_addr().unwrap().to_string();

        let table = PkTable::new([(kb.pk(), b_addr)]);
        let a = GenericClient::new(Keypair::generate(), Backend::Stcp(table), config());
        exchange(&a, &b).await;
        assert!(a.inner.porter.is_empty());

        b.close().await;
        b.close().await;
    }

    #[tokio::test]
    async fn test_stcp_missing_table_entry() {
        let a = GenericClient::new(Keypair::generate(), Backend::Stcp(PkTable::default()), config());
        let err = a.dial(Keypair::generate().pk(), 45).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_dial_closed_port_is_rejected() {
        let kb = Keypair::generate();
        let b = GenericClient::new(kb.clone(), Backend::Stcp(PkTable::default()), config());
        b.start().await.unwrap();
        let table = PkTable::new([(kb.pk(), b.local_addr().unwrap().to_string())]);
        let a = GenericClient::new(Keypair::generate(), Backend::Stcp(table), config());

        let err = a.dial(kb.pk(), 9).await.unwrap_err();
        assert!(matches!(
            err,
            NetworkError::Handshake(HandshakeError::NotListening)
        ));
        assert_eq!(err.to_string(), "not listening on given port");
        assert!(a.inner.porter.is_empty());
        b.close().await;
    }

    #[tokio::test]
    async fn test_stcpr_and_sudph_through_resolver() {
        let resolver = Arc::new(MemoryResolver::new());
        for backend in [
            Backend::Stcpr(resolver.clone()),
            Backend::Sudph(resolver.clone()),
        ] {
            let b = GenericClient::new(Keypair::generate(), backend.clone(), config());
            b.start().await.unwrap();
            let a = GenericClient::new(Keypair::generate(), backend, config());
            exchange(&a, &b).await;
            b.close().await;
        }
    }

    #[tokio::test]
    async fn test_listen_port_occupied() {
        let c = GenericClient::new(Keypair::generate(), Backend::Stcp(PkTable::default()), config());
        let _l = c.listen(45).await.unwrap();
        assert!(matches!(
            c.listen(45).await,
            Err(NetworkError::PortOccupied(45))
        ));
        c.close().await;
        assert!(matches!(c.listen(46).await, Err(NetworkError::Closed)));
    }
}
