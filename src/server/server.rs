//! Relay server.
//!
//! Accepts Noise_XK sessions from relay clients over TCP, routes streams
//! between them and keeps its discovery entry up to date.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::ServerSession;
use crate::core::{Duplex, SERVER_UPDATE_INTERVAL, SESSION_HANDSHAKE_TIMEOUT};
use crate::crypto::{Keypair, PubKey, respond_xk};
use crate::disc::DiscoveryClient;
use crate::network::TcpDuplex;
use crate::relay::{EntityCommon, RelayError, SessionCallbacks};

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of concurrent client sessions.
    pub max_sessions: usize,

    /// How often the discovery entry is refreshed.
    pub update_interval: Duration,

    /// Address advertised in discovery. Defaults to the listener address.
    pub public_address: Option<String>,

    /// Session table hooks.
    pub callbacks: SessionCallbacks,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 2048,
            update_interval: SERVER_UPDATE_INTERVAL,
            public_address: None,
            callbacks: SessionCallbacks::default(),
        }
    }
}

/// Builder for [`ServerConfig`].
#[derive(Debug)]
pub struct ServerBuilder {
    config: ServerConfig,
}

impl ServerBuilder {
    /// Create a new server builder.
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
        }
    }

    /// Set the maximum number of concurrent sessions.
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.config.max_sessions = max;
        self
    }

    /// Set the discovery refresh interval.
    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.config.update_interval = interval;
        self
    }

    /// Set the address advertised in discovery.
    pub fn public_address(mut self, address: impl Into<String>) -> Self {
        self.config.public_address = Some(address.into());
        self
    }

    /// Set the session table hooks.
    pub fn callbacks(mut self, callbacks: SessionCallbacks) -> Self {
        self.config.callbacks = callbacks;
        self
    }

    /// Build the server configuration.
    pub fn build(self) -> ServerConfig {
        self.config
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ServerInner {
    common: EntityCommon<ServerSession>,
    config: ServerConfig,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
    ready: watch::Sender<bool>,
    done: watch::Sender<bool>,
    closed: AtomicBool,
}

/// A relay server. Cloning yields another handle to the same server.
///
/// # Example
///
/// ```ignore
/// let server = Server::new(keys, disc, ServerBuilder::new().max_sessions(100).build());
/// tokio::spawn({
///     let server = server.clone();
///     async move { server.listen_and_serve("0.0.0.0:8081").await }
/// });
/// server.ready().await?;
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server. Nothing is accepted until [`serve`](Self::serve).
    pub fn new(keys: Keypair, disc: Arc<dyn DiscoveryClient>, config: ServerConfig) -> Self {
        let common = EntityCommon::new(keys, disc, config.callbacks.clone());
        Self {
            inner: Arc::new(ServerInner {
                common,
                config,
                local_addr: parking_lot::Mutex::new(None),
                ready: watch::channel(false).0,
                done: watch::channel(false).0,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Local public key.
    pub fn pk(&self) -> PubKey {
        self.inner.common.pk()
    }

    /// Address the server is listening on, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Number of connected clients.
    pub async fn session_count(&self) -> usize {
        self.inner.common.session_count().await
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Wait until the server entry has been published.
    pub async fn ready(&self) -> Result<(), RelayError> {
        let mut ready = self.inner.ready.subscribe();
        let mut done = self.inner.done.subscribe();
        tokio::select! {
            _ = ready.wait_for(|r| *r) => Ok(()),
            _ = done.wait_for(|d| *d) => Err(RelayError::EntityClosed),
        }
    }

    /// Bind `addr` and serve on it.
    pub async fn listen_and_serve(&self, addr: &str) -> Result<(), RelayError> {
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener).await
    }

    /// Accept client sessions from `listener` until the server closes.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), RelayError> {
        if self.is_closed() {
            return Err(RelayError::EntityClosed);
        }
        let local = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(local);
        let address = self
            .inner
            .config
            .public_address
            .clone()
            .unwrap_or_else(|| local.to_string());

        self.inner.update_entry(&address).await?;
        self.inner.ready.send_replace(true);
        info!(pk = %self.pk(), addr = %address, "Relay server serving");

        let updater = Arc::clone(&self.inner);
        let advertised = address.clone();
        tokio::spawn(async move { updater.update_loop(advertised).await });

        let mut done = self.inner.done.subscribe();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = done.wait_for(|d| *d) => return Ok(()),
            };
            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Accept failed");
                    continue;
                }
            };
            if self.session_count().await >= self.inner.config.max_sessions {
                debug!(peer = %peer, "Refusing connection, session limit reached");
                continue;
            }
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                if let Err(e) = inner.handle_conn(stream).await {
                    debug!(peer = %peer, error = %e, "Client session failed");
                }
            });
        }
    }

    /// Stop accepting and close every session. Later calls do nothing.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.done.send_replace(true);
        for (_, session) in self.inner.common.take_sessions().await {
            session.close().await;
        }
        info!(pk = %self.pk(), "Relay server closed");
    }
}

impl ServerInner {
    async fn update_entry(&self, address: &str) -> Result<(), RelayError> {
        let count = self.common.session_count().await;
        let available = self.config.max_sessions.saturating_sub(count);
        self.common
            .update_server_entry(address.to_string(), available as i64)
            .await
    }

    async fn update_loop(&self, address: String) {
        let mut done = self.done.subscribe();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.update_interval) => {}
                _ = done.wait_for(|d| *d) => return,
            }
            if let Err(e) = self.update_entry(&address).await {
                warn!(error = %e, "Failed to refresh server entry");
            }
        }
    }

    async fn handle_conn(&self, stream: TcpStream) -> Result<(), RelayError> {
        let io: Arc<dyn Duplex> = Arc::new(TcpDuplex::new(stream)?);
        let handshake = tokio::time::timeout(
            SESSION_HANDSHAKE_TIMEOUT,
            respond_xk(Arc::clone(&io), self.common.keys()),
        )
        .await;
        let (noise, client_pk) = match handshake {
            Ok(Ok(done)) => done,
            Ok(Err(e)) => {
                let _ = io.close().await;
                return Err(e.into());
            }
            Err(_) => {
                let _ = io.close().await;
                return Err(RelayError::Timeout("session handshake"));
            }
        };

        let session = Arc::new(ServerSession::new(client_pk, Arc::new(noise)));
        // A reconnecting client supersedes its previous session.
        if let Some(old) = self.common.del_session(&client_pk).await {
            old.close().await;
        }
        if !self.common.set_session(client_pk, Arc::clone(&session)).await {
            session.close().await;
            return Err(RelayError::Protocol(format!(
                "concurrent sessions from {client_pk}"
            )));
        }
        if self.closed.load(Ordering::Acquire) {
            self.common.del_session_if(&client_pk, &session).await;
            session.close().await;
            return Err(RelayError::EntityClosed);
        }
        debug!(client = %client_pk, "Client session established");

        let result = session.serve(&self.common).await;
        self.common.del_session_if(&client_pk, &session).await;
        result
    }
}
