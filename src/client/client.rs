//! Relay client.
//!
//! A [`Client`] keeps sessions with a few relay servers found through
//! discovery, publishes them as its delegated servers, and dials or accepts
//! [`Stream`]s through them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{ClientSession, PortEntry, Stream};
use crate::core::{
    Addr, CLIENT_SERVE_WAIT, DEFAULT_WINDOW_SIZE, Duplex, NetworkType, SESSION_DIAL_TIMEOUT,
    SESSION_HANDSHAKE_TIMEOUT,
};
use crate::crypto::{Keypair, PubKey, initiate_xk};
use crate::disc::{DiscEntry, DiscoveryClient};
use crate::network::{Listener, TcpDuplex};
use crate::porter::Porter;
use crate::relay::{EntityCommon, RelayError, SessionCallbacks};

/// Relay client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Number of relay sessions the client keeps open.
    pub min_sessions: usize,

    /// Read window advertised for every stream.
    pub window: usize,

    /// Pause between session maintenance rounds.
    pub serve_wait: Duration,

    /// Session table hooks.
    pub callbacks: SessionCallbacks,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            min_sessions: 1,
            window: DEFAULT_WINDOW_SIZE,
            serve_wait: CLIENT_SERVE_WAIT,
            callbacks: SessionCallbacks::default(),
        }
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientBuilder {
    config: ClientConfig,
}

impl ClientBuilder {
    /// Create a builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of sessions to maintain.
    pub fn min_sessions(mut self, n: usize) -> Self {
        self.config.min_sessions = n;
        self
    }

    /// Set the advertised stream window.
    pub fn window(mut self, window: usize) -> Self {
        self.config.window = window;
        self
    }

    /// Set the pause between maintenance rounds.
    pub fn serve_wait(mut self, wait: Duration) -> Self {
        self.config.serve_wait = wait;
        self
    }

    /// Set the session table hooks.
    pub fn callbacks(mut self, callbacks: SessionCallbacks) -> Self {
        self.config.callbacks = callbacks;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ClientConfig {
        self.config
    }
}

struct ClientInner {
    common: EntityCommon<ClientSession>,
    porter: Porter<PortEntry>,
    config: ClientConfig,
    published: parking_lot::Mutex<Option<Vec<PubKey>>>,
    ready: watch::Sender<bool>,
    done: watch::Sender<bool>,
    closed: AtomicBool,
}

/// A relay client. Cloning yields another handle to the same client.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a client. Call [`serve`](Self::serve) to start maintaining
    /// sessions.
    pub fn new(keys: Keypair, disc: Arc<dyn DiscoveryClient>, config: ClientConfig) -> Self {
        let common = EntityCommon::new(keys, disc, config.callbacks.clone());
        Self {
            inner: Arc::new(ClientInner {
                common,
                porter: Porter::default(),
                config,
                published: parking_lot::Mutex::new(None),
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

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.inner.common.session_count().await
    }

    /// Keys of the servers the client has sessions with.
    pub async fn delegated_servers(&self) -> Vec<PubKey> {
        self.inner.common.session_pks().await
    }

    /// Wait until the client has published its discovery entry once.
    pub async fn ready(&self) -> Result<(), RelayError> {
        let mut ready = self.inner.ready.subscribe();
        let mut done = self.inner.done.subscribe();
        tokio::select! {
            _ = ready.wait_for(|r| *r) => Ok(()),
            _ = done.wait_for(|d| *d) => Err(RelayError::EntityClosed),
        }
    }

    /// Maintain sessions and the discovery entry until the client closes.
    pub async fn serve(&self) {
        let mut done = self.inner.done.subscribe();
        info!(pk = %self.pk(), "Relay client serving");
        loop {
            if self.is_closed() {
                return;
            }
            if let Err(e) = self.inner.maintain().await {
                debug!(pk = %self.pk(), error = %e, "Session maintenance round failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.inner.config.serve_wait) => {}
                _ = done.wait_for(|d| *d) => return,
            }
        }
    }

    /// Dial a stream to `addr` through one of the remote's delegated servers.
    ///
    /// Sessions that already exist are tried first; then a session is
    /// established with each remaining server in turn.
    pub async fn dial(&self, addr: Addr) -> Result<Arc<Stream>, RelayError> {
        if self.is_closed() {
            return Err(RelayError::EntityClosed);
        }
        let entry = self.inner.common.client_entry(&addr.pk).await?;
        let delegated = entry.delegated_servers().to_vec();

        let mut tried = Vec::new();
        for server in &delegated {
            if let Some(session) = self.inner.common.session(server).await {
                tried.push(*server);
                match session.dial_stream(addr).await {
                    Ok(stream) => return Ok(stream),
                    Err(e) => debug!(server = %server, remote = %addr, error = %e, "Dial via existing session failed"),
                }
            }
        }

        for server in delegated.iter().filter(|s| !tried.contains(s)) {
            let entry = match self.inner.common.server_entry(server).await {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(server = %server, error = %e, "Delegated server lookup failed");
                    continue;
                }
            };
            let session = match self.inner.ensure_session(&entry).await {
                Ok(session) => session,
                Err(e) => {
                    debug!(server = %server, error = %e, "Failed to establish session");
                    continue;
                }
            };
            match session.dial_stream(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => debug!(server = %server, remote = %addr, error = %e, "Dial via new session failed"),
            }
        }

        Err(RelayError::CannotConnectToDelegated)
    }

    /// Listen for streams on `port`.
    pub fn listen(&self, port: u16) -> Result<Arc<Listener<Stream>>, RelayError> {
        if self.is_closed() {
            return Err(RelayError::EntityClosed);
        }
        let listener = Arc::new(Listener::new(Addr::new(self.pk(), port), NetworkType::Dmsg));
        let freer = self
            .inner
            .porter
            .reserve(port, PortEntry::Listener(Arc::clone(&listener)))
            .ok_or(RelayError::PortOccupied)?;
        listener.bind_freer(freer);
        Ok(listener)
    }

    /// Close every session and listener. Later calls do nothing.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.done.send_replace(true);

        for (_, session) in self.inner.common.take_sessions().await {
            session.close().await;
        }
        for (_, entry) in self.inner.porter.close_all() {
            if let PortEntry::Listener(listener) = entry {
                listener.close().await;
            }
        }
        info!(pk = %self.pk(), "Relay client closed");
    }
}

impl ClientInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn maintain(self: &Arc<Self>) -> Result<(), RelayError> {
        if self.common.session_count().await < self.config.min_sessions {
            let servers = self.common.disc().available_servers().await?;
            for entry in &servers {
                if self.common.session_count().await >= self.config.min_sessions {
                    break;
                }
                if let Err(e) = self.ensure_session(entry).await {
                    debug!(server = %entry.static_pk, error = %e, "Failed to establish session");
                }
            }
        }

        let current = self.common.session_pks().await;
        let stale = self.published.lock().as_ref() != Some(&current);
        if stale {
            self.common.update_client_entry().await?;
            *self.published.lock() = Some(current);
            self.ready.send_replace(true);
        }
        Ok(())
    }

    async fn ensure_session(
        self: &Arc<Self>,
        entry: &DiscEntry,
    ) -> Result<Arc<ClientSession>, RelayError> {
        let server_pk = entry.static_pk;
        if let Some(session) = self.common.session(&server_pk).await {
            return Ok(session);
        }
        if self.is_closed() {
            return Err(RelayError::EntityClosed);
        }
        let address = entry
            .server
            .as_ref()
            .map(|s| s.address.clone())
            .ok_or(RelayError::DiscEntryIsNotServer)?;

        let tcp = tokio::time::timeout(SESSION_DIAL_TIMEOUT, TcpDuplex::connect(&address))
            .await
            .map_err(|_| RelayError::Timeout("session dial"))??;
        let io: Arc<dyn Duplex> = Arc::new(tcp);
        let handshake = tokio::time::timeout(
            SESSION_HANDSHAKE_TIMEOUT,
            initiate_xk(Arc::clone(&io), self.common.keys(), &server_pk),
        )
        .await;
        let noise = match handshake {
            Ok(Ok(noise)) => noise,
            Ok(Err(e)) => {
                let _ = io.close().await;
                return Err(e.into());
            }
            Err(_) => {
                let _ = io.close().await;
                return Err(RelayError::Timeout("session handshake"));
            }
        };

        let session = Arc::new(ClientSession::new(
            self.common.pk(),
            server_pk,
            Arc::new(noise),
            self.porter.clone(),
            self.config.window,
        ));
        if !self.common.set_session(server_pk, Arc::clone(&session)).await {
            session.close().await;
            return self
                .common
                .session(&server_pk)
                .await
                .ok_or(RelayError::SessionClosed);
        }
        info!(server = %server_pk, addr = %address, "Relay session established");

        let inner = Arc::clone(self);
        let serving = Arc::clone(&session);
        tokio::spawn(async move {
            if let Err(e) = serving.serve().await {
                debug!(server = %server_pk, error = %e, "Relay session ended");
            }
            let removed = inner.common.del_session_if(&server_pk, &serving).await;
            if removed && !inner.is_closed() {
                // Stop advertising a server we can no longer be reached through.
                if let Err(e) = inner.common.update_client_entry().await {
                    warn!(server = %server_pk, error = %e, "Failed to update entry after session loss");
                } else {
                    *inner.published.lock() = Some(inner.common.session_pks().await);
                }
            }
        });
        Ok(session)
    }
}
