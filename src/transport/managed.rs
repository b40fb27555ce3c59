//! A logical transport to one remote visor over one network.
//!
//! The ID and entry stay fixed for the lifetime of the transport while the
//! underlying connection may be replaced: a dropped connection leaves the
//! transport waiting for a fresh one (dialed or accepted) for a grace period
//! before it closes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::{
    Entry, Label, LogEntry, LogRecord, LogStore, Packet, Status, TpdClient, TpdError,
    TransportError, TransportResult, settle_initiator_within, settle_responder_within,
};
use crate::core::{
    DEREGISTER_ATTEMPTS, DEREGISTER_BACKOFF, LOG_FLUSH_INTERVAL, NetworkType, REHOME_GRACE,
    SETTLEMENT_TIMEOUT, TRANSPORT_PORT, TransportConn,
};
use crate::crypto::{Keypair, PubKey};
use crate::network::NetworkClient;

/// Default for [`ManagedTransportConfig::rehome_grace`].
pub const DEFAULT_REHOME_GRACE: Duration = REHOME_GRACE;

/// Everything a [`ManagedTransport`] needs.
#[derive(Clone)]
pub struct ManagedTransportConfig {
    /// Client of the network the transport runs over.
    pub client: Arc<dyn NetworkClient>,
    /// Local keys, matching the client's.
    pub keys: Keypair,
    /// Transport discovery.
    pub tpd: Arc<dyn TpdClient>,
    /// Where traffic counters are persisted.
    pub log_store: Arc<dyn LogStore>,
    /// Remote visor.
    pub remote: PubKey,
    /// Origin of the transport.
    pub label: Label,
    /// How long a transport without connection waits for a replacement.
    pub rehome_grace: Duration,
}

/// Operational summary of a transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportSummary {
    /// Transport ID.
    pub id: Uuid,
    /// Local edge.
    pub local: PubKey,
    /// Remote edge.
    pub remote: PubKey,
    /// Network the transport runs over.
    #[serde(rename = "type")]
    pub network: NetworkType,
    /// Origin of the transport.
    pub label: Label,
    /// Whether a connection is currently set.
    pub is_up: bool,
    /// Traffic counters.
    pub log: LogRecord,
}

/// Runtime state of one transport.
pub struct ManagedTransport {
    entry: Entry,
    local: PubKey,
    remote: PubKey,
    keys: Keypair,
    client: Arc<dyn NetworkClient>,
    tpd: Arc<dyn TpdClient>,
    log_store: Arc<dyn LogStore>,
    log: LogEntry,
    log_updates: AtomicU32,
    conn: parking_lot::Mutex<Option<Arc<dyn TransportConn>>>,
    conn_gen: watch::Sender<u64>,
    // Serializes dial, accept and update so only one connection is set up at a time.
    setup: Mutex<()>,
    registered: AtomicBool,
    serving: AtomicBool,
    rehome_grace: Duration,
    done: watch::Sender<bool>,
    closed: AtomicBool,
}

impl ManagedTransport {
    /// Create a transport with no connection yet.
    pub fn new(config: ManagedTransportConfig) -> Self {
        let local = config.client.pk();
        let entry = Entry::new(local, config.remote, config.client.network_type(), config.label);
        Self {
            entry,
            local,
            remote: config.remote,
            keys: config.keys,
            client: config.client,
            tpd: config.tpd,
            log_store: config.log_store,
            log: LogEntry::new(),
            log_updates: AtomicU32::new(0),
            conn: parking_lot::Mutex::new(None),
            conn_gen: watch::channel(0).0,
            setup: Mutex::new(()),
            registered: AtomicBool::new(false),
            serving: AtomicBool::new(false),
            rehome_grace: config.rehome_grace,
            done: watch::channel(false).0,
            closed: AtomicBool::new(false),
        }
    }

    /// Transport ID.
    pub fn id(&self) -> Uuid {
        self.entry.id
    }

    /// Transport entry.
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    /// Remote visor.
    pub fn remote(&self) -> PubKey {
        self.remote
    }

    /// Network the transport runs over.
    pub fn network(&self) -> NetworkType {
        self.entry.network
    }

    /// Origin of the transport.
    pub fn label(&self) -> Label {
        self.entry.label
    }

    /// Traffic counters.
    pub fn log_entry(&self) -> &LogEntry {
        &self.log
    }

    /// Whether teardown has begun. The transport cannot be reused.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Whether a connection is currently set.
    pub fn is_up(&self) -> bool {
        self.current().is_some()
    }

    /// Whether the local visor is the lower edge. The lower edge keeps its
    /// existing connection when both edges connect at once.
    pub fn is_least_significant_edge(&self) -> bool {
        self.entry.is_least_significant_edge(&self.local)
    }

    /// Status as reported to transport discovery.
    pub fn status(&self) -> Status {
        Status {
            id: self.id(),
            is_up: self.is_up(),
        }
    }

    /// Operational summary.
    pub fn summary(&self) -> TransportSummary {
        TransportSummary {
            id: self.id(),
            local: self.local,
            remote: self.remote,
            network: self.network(),
            label: self.label(),
            is_up: self.is_up(),
            log: self.log.snapshot(),
        }
    }

    fn current(&self) -> Option<Arc<dyn TransportConn>> {
        if self.is_closed() {
            return None;
        }
        self.conn.lock().clone()
    }

    /// Dial the remote unless a connection is already set.
    pub async fn dial(&self) -> TransportResult<()> {
        let _setup = self.setup.lock().await;
        if self.is_closed() {
            return Err(TransportError::NotServing);
        }
        if self.current().is_some() {
            return Ok(());
        }

        let conn = self.client.dial(self.remote, TRANSPORT_PORT).await?;
        debug!(tp_id = %self.id(), remote = %self.remote, "Performing settlement handshake");
        if let Err(e) = settle_initiator_within(conn.as_ref(), &self.keys, SETTLEMENT_TIMEOUT).await {
            let _ = conn.close().await;
            return Err(e.into());
        }
        self.set_transport(conn).await
    }

    /// Settle an accepted connection and make it the underlying one.
    pub async fn accept(&self, conn: Arc<dyn TransportConn>) -> TransportResult<()> {
        let _setup = self.setup.lock().await;
        self.check_offered(&conn).await?;

        debug!(tp_id = %self.id(), remote = %self.remote, "Performing settlement handshake");
        if let Err(e) = settle_responder_within(
            conn.as_ref(),
            &self.keys,
            self.tpd.as_ref(),
            SETTLEMENT_TIMEOUT,
        )
        .await
        {
            let _ = conn.close().await;
            return Err(e.into());
        }
        self.set_transport(conn).await
    }

    /// Replace the underlying connection with an already settled one.
    pub async fn update_transport(&self, conn: Arc<dyn TransportConn>) -> TransportResult<()> {
        let _setup = self.setup.lock().await;
        self.check_offered(&conn).await?;
        self.set_transport(conn).await
    }

    async fn check_offered(&self, conn: &Arc<dyn TransportConn>) -> TransportResult<()> {
        let err = if conn.network_type() != self.network() {
            TransportError::WrongNetwork {
                expected: self.network(),
                got: conn.network_type(),
            }
        } else if self.is_closed() {
            TransportError::NotServing
        } else {
            return Ok(());
        };
        if let Err(e) = conn.close().await {
            warn!(tp_id = %self.id(), error = %e, "Failed to close offered connection");
        }
        Err(err)
    }

    async fn set_transport(&self, conn: Arc<dyn TransportConn>) -> TransportResult<()> {
        if self.current().is_some() && self.is_least_significant_edge() {
            debug!(tp_id = %self.id(), "Underlying transport already exists, closing new one");
            let _ = conn.close().await;
            return Err(TransportError::AlreadyExists);
        }

        let old = self.conn.lock().replace(conn);
        if let Some(old) = old {
            debug!(tp_id = %self.id(), "Underlying transport already exists, closing old one");
            if let Err(e) = old.close().await {
                warn!(tp_id = %self.id(), error = %e, "Failed to close old transport");
            }
        }
        self.registered.store(true, Ordering::Release);
        self.conn_gen.send_modify(|g| *g += 1);

        if self.is_closed() {
            let raced = self.conn.lock().take();
            if let Some(conn) = raced {
                let _ = conn.close().await;
            }
            return Err(TransportError::NotServing);
        }
        Ok(())
    }

    async fn detach(&self, conn: &Arc<dyn TransportConn>) {
        let removed = {
            let mut slot = self.conn.lock();
            let same = slot
                .as_ref()
                .is_some_and(|c| std::ptr::addr_eq(Arc::as_ptr(c), Arc::as_ptr(conn)));
            if same { slot.take() } else { None }
        };
        if let Some(conn) = removed {
            let _ = conn.close().await;
        }
    }

    async fn wait_conn(&self, grace: Duration) -> Option<Arc<dyn TransportConn>> {
        let mut generation = self.conn_gen.subscribe();
        let mut done = self.done.subscribe();
        let wait = async {
            loop {
                if let Some(conn) = self.current() {
                    return Some(conn);
                }
                tokio::select! {
                    changed = generation.changed() => {
                        if changed.is_err() {
                            return None;
                        }
                    }
                    _ = done.wait_for(|d| *d) => return None,
                }
            }
        };
        tokio::time::timeout(grace, wait).await.ok().flatten()
    }

    /// Write one packet to the remote.
    pub async fn write_packet(&self, packet: &Packet) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::NotServing);
        }
        let conn = self.current().ok_or(TransportError::NotSetUp)?;
        if let Err(e) = conn.write_all(packet.as_bytes()).await {
            debug!(tp_id = %self.id(), error = %e, "Failed to write packet");
            self.detach(&conn).await;
            return Err(e.into());
        }
        self.log.add_sent(packet.size() as u64);
        self.log_updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Start delivering inbound packets to `packets` and flushing counters.
    /// Later calls do nothing.
    pub async fn serve(self: &Arc<Self>, packets: mpsc::Sender<Packet>) {
        if self.serving.swap(true, Ordering::AcqRel) {
            return;
        }
        match self.log_store.entry(&self.id()).await {
            Ok(Some(record)) => {
                self.log.add_recv(record.recv);
                self.log.add_sent(record.sent);
            }
            Ok(None) => {}
            Err(e) => warn!(tp_id = %self.id(), error = %e, "Failed to load log entry"),
        }
        debug!(tp_id = %self.id(), remote = %self.remote, network = %self.network(), "Serving");
        tokio::spawn(Arc::clone(self).read_loop(packets));
        tokio::spawn(Arc::clone(self).log_loop());
    }

    async fn read_loop(self: Arc<Self>, packets: mpsc::Sender<Packet>) {
        let mut done = self.done.subscribe();
        loop {
            let Some(conn) = self.wait_conn(self.rehome_grace).await else {
                if !self.is_closed() {
                    warn!(tp_id = %self.id(), "No replacement connection arrived, closing transport");
                    self.close().await;
                }
                break;
            };

            match Packet::read_from(conn.as_ref()).await {
                Ok(packet) => {
                    trace!(tp_id = %self.id(), packet = ?packet, "Received packet");
                    self.log.add_recv(packet.size() as u64);
                    self.log_updates.fetch_add(1, Ordering::Relaxed);
                    tokio::select! {
                        sent = packets.send(packet) => {
                            if sent.is_err() {
                                debug!(tp_id = %self.id(), "Packet queue closed");
                                break;
                            }
                        }
                        _ = done.wait_for(|d| *d) => break,
                    }
                }
                Err(e) => {
                    if self.is_closed() {
                        break;
                    }
                    warn!(tp_id = %self.id(), error = %e, "Failed to read packet, awaiting new connection");
                    self.detach(&conn).await;
                }
            }
        }
        debug!(tp_id = %self.id(), "Stopped read loop");
    }

    async fn log_loop(self: Arc<Self>) {
        let mut done = self.done.subscribe();
        let mut ticker = tokio::time::interval(LOG_FLUSH_INTERVAL);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = done.wait_for(|d| *d) => break,
            }
            self.record_log().await;
        }
        self.record_log().await;
        debug!(tp_id = %self.id(), "Stopped log loop");
    }

    async fn record_log(&self) {
        let ops = self.log_updates.swap(0, Ordering::AcqRel);
        if ops == 0 {
            return;
        }
        trace!(tp_id = %self.id(), ops, "Recording log entry");
        if let Err(e) = self.log_store.record(&self.id(), self.log.snapshot()).await {
            warn!(tp_id = %self.id(), error = %e, "Failed to record log entry");
        }
    }

    /// Remove the entry from transport discovery, retrying with backoff.
    /// An entry that is already gone counts as removed.
    pub async fn deregister(&self) -> Result<(), TpdError> {
        let mut backoff = DEREGISTER_BACKOFF;
        let mut attempt = 1;
        loop {
            match self.tpd.delete_transport(self.id()).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) if attempt >= DEREGISTER_ATTEMPTS => return Err(e),
                Err(e) => {
                    debug!(tp_id = %self.id(), attempt, error = %e, "Failed to deregister transport, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
            }
        }
    }

    /// Close the connection, stop background work and deregister from
    /// transport discovery. Later calls do nothing.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.done.send_replace(true);

        let conn = self.conn.lock().take();
        if let Some(conn) = conn {
            if let Err(e) = conn.close().await {
                warn!(tp_id = %self.id(), error = %e, "Failed to close underlying transport");
            }
        }
        if self.registered.load(Ordering::Acquire) {
            if let Err(e) = self.deregister().await {
                warn!(tp_id = %self.id(), error = %e, "Failed to deregister transport");
            }
        }
        info!(tp_id = %self.id(), remote = %self.remote, network = %self.network(), "Transport closed");
    }
}

impl std::fmt::Debug for ManagedTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedTransport")
            .field("id", &self.id())
            .field("remote", &self.remote)
            .field("network", &self.network())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Addr, Duplex, memory_pipe};
    use crate::network::{Backend, Conn, GenericClient, GenericClientConfig, PkTable};
    use crate::transport::{MemoryLogStore, MemoryTpd, settle_initiator};

    struct Fixture {
        local: Keypair,
        remote: Keypair,
        tpd: Arc<MemoryTpd>,
        store: Arc<MemoryLogStore>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                local: Keypair::generate(),
                remote: Keypair::generate(),
                tpd: Arc::new(MemoryTpd::new()),
                store: Arc::new(MemoryLogStore::new()),
            }
        }

        fn transport(&self, grace: Duration) -> Arc<ManagedTransport> {
            let client = GenericClient::new(
                self.local.clone(),
                Backend::Stcp(PkTable::default()),
                GenericClientConfig::default(),
            );
            Arc::new(ManagedTransport::new(ManagedTransportConfig {
                client: Arc::new(client),
                keys: self.local.clone(),
                tpd: self.tpd.clone(),
                log_store: self.store.clone(),
                remote: self.remote.pk(),
                label: Label::User,
                rehome_grace: grace,
            }))
        }

        // Returns (remote side, local side).
        fn pipe(&self, network: NetworkType) -> (Conn, Arc<dyn TransportConn>) {
            let (a, b) = memory_pipe(64 * 1024);
            let remote = Addr::new(self.remote.pk(), 50001);
            let local = Addr::new(self.local.pk(), 45);
            (
                Conn::new(Arc::new(a), remote, local, network, None),
                Arc::new(Conn::new(Arc::new(b), local, remote, network, None)),
            )
        }

        async fn accepted(&self, mt: &ManagedTransport) -> Conn {
            let (peer, conn) = self.pipe(NetworkType::Stcp);
            let (settled, accepted) =
                tokio::join!(settle_initiator(&peer, &self.remote), mt.accept(conn));
            settled.unwrap();
            accepted.unwrap();
            peer
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_accept_and_exchange_packets() {
        let fx = Fixture::new();
        let mt = fx.transport(DEFAULT_REHOME_GRACE);
        let peer = fx.accepted(&mt).await;
        assert!(mt.is_up());
        assert!(fx.tpd.signed_entry(&mt.id()).is_some());

        let (tx, mut rx) = mpsc::channel(4);
        mt.serve(tx).await;

        let inbound = Packet::data(3, b"hi").unwrap();
        peer.write_all(inbound.as_bytes()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), inbound);

        let outbound = Packet::data(4, b"yo!").unwrap();
        mt.write_packet(&outbound).await.unwrap();
        assert_eq!(Packet::read_from(&peer).await.unwrap(), outbound);

        assert_eq!(mt.log_entry().snapshot(), LogRecord { recv: 2, sent: 3 });
        mt.close().await;
    }

    fn assert_send<T: Send>(_: &T) {}

    #[tokio::test]
    async fn test_log_loop_flushes_on_close() {
        let fx = Fixture::new();
        let mt = fx.transport(DEFAULT_REHOME_GRACE);
        let (tx, _rx) = mpsc::channel(4);
        assert_send(&Arc::clone(&mt).log_loop());
        assert_send(&Arc::clone(&mt).read_loop(tx.clone()));

        let peer = fx.accepted(&mt).await;
        mt.serve(tx).await;
        mt.write_packet(&Packet::data(2, b"abc").unwrap()).await.unwrap();
        let _ = Packet::read_from(&peer).await.unwrap();

        mt.close().await;
        eventually(|| fx.store.get(&mt.id()) == Some(LogRecord { recv: 0, sent: 3 })).await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_deregisters() {
        let fx = Fixture::new();
        let mt = fx.transport(DEFAULT_REHOME_GRACE);
        let peer = fx.accepted(&mt).await;

        tokio::join!(mt.close(), mt.close(), mt.close(), mt.close());
        assert!(mt.is_closed());
        assert!(fx.tpd.is_empty());
        assert!(matches!(
            mt.write_packet(&Packet::keep_alive(1)).await,
            Err(TransportError::NotServing)
        ));
        assert!(Packet::read_from(&peer).await.is_err());
    }

    #[tokio::test]
    async fn test_rehomes_onto_replacement_connection() {
        let fx = Fixture::new();
        let mt = fx.transport(DEFAULT_REHOME_GRACE);
        let first = fx.accepted(&mt).await;
        let (tx, mut rx) = mpsc::channel(4);
        mt.serve(tx).await;

        first.close().await.unwrap();
        eventually(|| !mt.is_up()).await;
        assert!(!mt.is_closed());

        let (second, conn) = fx.pipe(NetworkType::Stcp);
        mt.update_transport(conn).await.unwrap();
        let packet = Packet::data(8, b"again").unwrap();
        second.write_all(packet.as_bytes()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), packet);
        mt.close().await;
    }

    #[tokio::test]
    async fn test_closes_without_replacement() {
        let fx = Fixture::new();
        let mt = fx.transport(Duration::from_millis(50));
        let peer = fx.accepted(&mt).await;
        let (tx, _rx) = mpsc::channel(4);
        mt.serve(tx).await;

        peer.close().await.unwrap();
        eventually(|| mt.is_closed()).await;
    }

    #[tokio::test]
    async fn test_wrong_network_is_rejected() {
        let fx = Fixture::new();
        let mt = fx.transport(DEFAULT_REHOME_GRACE);
        let (_peer, conn) = fx.pipe(NetworkType::Sudph);
        assert!(matches!(
            mt.accept(conn).await,
            Err(TransportError::WrongNetwork {
                expected: NetworkType::Stcp,
                got: NetworkType::Sudph
            })
        ));
        assert!(!mt.is_up());
    }

    #[tokio::test]
    async fn test_counters_resume_from_store() {
        let fx = Fixture::new();
        let mt = fx.transport(DEFAULT_REHOME_GRACE);
        fx.store
            .record(&mt.id(), LogRecord { recv: 100, sent: 50 })
            .await
            .unwrap();
        let peer = fx.accepted(&mt).await;
        let (tx, _rx) = mpsc::channel(4);
        mt.serve(tx).await;

        mt.write_packet(&Packet::data(1, b"abcd").unwrap()).await.unwrap();
        let _ = Packet::read_from(&peer).await.unwrap();
        mt.close().await;
        eventually(|| {
            fx.store
                .get(&mt.id())
                .is_some_and(|r| r == LogRecord { recv: 100, sent: 54 })
        })
        .await;
    }
}
