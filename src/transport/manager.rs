//! The transport manager: the single authority on which transports exist.
//!
//! It owns one network client per backend, accepts transports on each of
//! them, dials transports on request, and funnels the packets of every
//! transport into one bounded inbound queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    DEFAULT_REHOME_GRACE, Label, LogStore, ManagedTransport, ManagedTransportConfig, ManagerError,
    MemoryLogStore, MemoryTpd, Packet, TpdClient, TransportError, TransportSummary,
    make_transport_id,
};
use crate::core::{
    CLEANUP_INTERVAL, NetworkType, PERSISTENT_DIAL_TIMEOUT, PERSISTENT_RECONNECT_INTERVAL,
    READ_QUEUE_SIZE, SAVE_TRANSPORT_RETRIES, TRANSPORT_PORT, TransportConn,
};
use crate::crypto::{Keypair, PubKey};
use crate::network::{ClientFactory, NetworkClient, TransportListener};

/// A transport the manager keeps re-establishing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PersistentTransport {
    /// Remote visor.
    pub pk: PubKey,
    /// Network to dial over.
    #[serde(rename = "type")]
    pub network: NetworkType,
}

/// Transport manager configuration.
#[derive(Clone)]
pub struct ManagerConfig {
    /// Local keys.
    pub keys: Keypair,
    /// Transport discovery.
    pub tpd: Arc<dyn TpdClient>,
    /// Where traffic counters are persisted.
    pub log_store: Arc<dyn LogStore>,
    /// Transports re-established periodically.
    pub persistent: Vec<PersistentTransport>,
    /// Capacity of the inbound packet queue.
    pub read_queue_size: usize,
    /// How often closed transports are dropped from the table.
    pub cleanup_interval: Duration,
    /// How often persistent transports are checked.
    pub reconnect_interval: Duration,
    /// Deadline of one persistent reconnect attempt.
    pub reconnect_timeout: Duration,
    /// How long a transport without connection waits for a replacement.
    pub rehome_grace: Duration,
}

/// Builder for [`ManagerConfig`].
pub struct ManagerBuilder {
    config: ManagerConfig,
}

impl ManagerBuilder {
    /// Start from defaults for `keys`, with in-memory discovery and log store.
    pub fn new(keys: Keypair) -> Self {
        Self {
            config: ManagerConfig {
                keys,
                tpd: Arc::new(MemoryTpd::new()),
                log_store: Arc::new(MemoryLogStore::new()),
                persistent: Vec::new(),
                read_queue_size: READ_QUEUE_SIZE,
                cleanup_interval: CLEANUP_INTERVAL,
                reconnect_interval: PERSISTENT_RECONNECT_INTERVAL,
                reconnect_timeout: PERSISTENT_DIAL_TIMEOUT,
                rehome_grace: DEFAULT_REHOME_GRACE,
            },
        }
    }

    /// Set the transport discovery client.
    pub fn tpd(mut self, tpd: Arc<dyn TpdClient>) -> Self {
        self.config.tpd = tpd;
        self
    }

    /// Set the log store.
    pub fn log_store(mut self, store: Arc<dyn LogStore>) -> Self {
        self.config.log_store = store;
        self
    }

    /// Set the persistent transports.
    pub fn persistent(mut self, persistent: Vec<PersistentTransport>) -> Self {
        self.config.persistent = persistent;
        self
    }

    /// Set the inbound queue capacity.
    pub fn read_queue_size(mut self, size: usize) -> Self {
        self.config.read_queue_size = size.max(1);
        self
    }

    /// Set the persistent reconnect interval.
    pub fn reconnect_interval(mut self, interval: Duration) -> Self {
        self.config.reconnect_interval = interval;
        self
    }

    /// Set the re-home grace period of new transports.
    pub fn rehome_grace(mut self, grace: Duration) -> Self {
        self.config.rehome_grace = grace;
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ManagerConfig {
        self.config
    }
}

type DialLocks = parking_lot::Mutex<HashMap<Uuid, Arc<Mutex<()>>>>;

struct ManagerInner {
    keys: Keypair,
    tpd: Arc<dyn TpdClient>,
    log_store: Arc<dyn LogStore>,
    config: ManagerConfig,
    persistent: parking_lot::RwLock<Vec<PersistentTransport>>,
    transports: parking_lot::RwLock<HashMap<Uuid, Arc<ManagedTransport>>>,
    dial_locks: DialLocks,
    clients: parking_lot::RwLock<HashMap<NetworkType, Arc<dyn NetworkClient>>>,
    read_tx: parking_lot::Mutex<Option<mpsc::Sender<Packet>>>,
    read_rx: Mutex<mpsc::Receiver<Packet>>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    serving: AtomicBool,
    ready: watch::Sender<bool>,
    done: watch::Sender<bool>,
    closed: AtomicBool,
}

/// The transport manager. Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct Manager {
    inner: Arc<ManagerInner>,
}

impl Manager {
    /// Create a manager with no network clients.
    pub fn new(config: ManagerConfig) -> Self {
        let (read_tx, read_rx) = mpsc::channel(config.read_queue_size.max(1));
        Self {
            inner: Arc::new(ManagerInner {
                keys: config.keys.clone(),
                tpd: Arc::clone(&config.tpd),
                log_store: Arc::clone(&config.log_store),
                persistent: parking_lot::RwLock::new(config.persistent.clone()),
                config,
                transports: parking_lot::RwLock::new(HashMap::new()),
                dial_locks: parking_lot::Mutex::new(HashMap::new()),
                clients: parking_lot::RwLock::new(HashMap::new()),
                read_tx: parking_lot::Mutex::new(Some(read_tx)),
                read_rx: Mutex::new(read_rx),
                tasks: parking_lot::Mutex::new(Vec::new()),
                serving: AtomicBool::new(false),
                ready: watch::channel(false).0,
                done: watch::channel(false).0,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Local public key.
    pub fn local_pk(&self) -> PubKey {
        self.inner.keys.pk()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Register, start and accept on a network client.
    ///
    /// Once the first client is added the manager is ready.
    pub async fn add_client(&self, client: Arc<dyn NetworkClient>) -> Result<(), ManagerError> {
        if self.is_closed() {
            return Err(ManagerError::Closed);
        }
        let network = client.network_type();
        if let Err(e) = client.start().await {
            warn!(network = %network, error = %e, "Failed to start network client");
        }
        let listener = client.listen(TRANSPORT_PORT).await?;
        self.inner.clients.write().insert(network, client);
        debug!(network = %network, port = TRANSPORT_PORT, "Listening for transports");

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(inner.accept_loop(listener, network));
        self.inner.tasks.lock().push(task);
        self.inner.ready.send_replace(true);
        Ok(())
    }

    /// Add a client for every network `factory` can build.
    pub async fn init_clients(&self, factory: &ClientFactory) -> Result<(), ManagerError> {
        for client in factory.make_all() {
            self.add_client(client).await?;
        }
        Ok(())
    }

    /// Wait until at least one network client was added.
    pub async fn ready(&self) -> Result<(), ManagerError> {
        let mut ready = self.inner.ready.subscribe();
        let mut done = self.inner.done.subscribe();
        tokio::select! {
            _ = ready.wait_for(|r| *r) => Ok(()),
            _ = done.wait_for(|d| *d) => Err(ManagerError::Closed),
        }
    }

    /// Start the cleanup and persistent reconnect loops. Later calls do
    /// nothing.
    pub fn serve(&self) {
        if self.is_closed() || self.inner.serving.swap(true, Ordering::AcqRel) {
            return;
        }
        let cleanup = tokio::spawn(Arc::clone(&self.inner).cleanup_loop());
        let reconnect = tokio::spawn(Arc::clone(&self.inner).reconnect_loop());
        self.inner.tasks.lock().extend([cleanup, reconnect]);
        debug!("Transport manager is serving");
    }

    /// Networks with a registered client, sorted.
    pub fn networks(&self) -> Vec<NetworkType> {
        let mut networks: Vec<_> = self.inner.clients.read().keys().copied().collect();
        networks.sort();
        networks
    }

    /// Whether a client is registered for `network`.
    pub fn is_known_network(&self, network: NetworkType) -> bool {
        self.inner.clients.read().contains_key(&network)
    }

    /// Client registered for `network`.
    pub fn client(&self, network: NetworkType) -> Option<Arc<dyn NetworkClient>> {
        self.inner.clients.read().get(&network).cloned()
    }

    /// Replace the persistent transports.
    pub fn set_persistent(&self, persistent: Vec<PersistentTransport>) {
        *self.inner.persistent.write() = persistent;
    }

    /// Current persistent transports.
    pub fn persistent(&self) -> Vec<PersistentTransport> {
        self.inner.persistent.read().clone()
    }

    /// Establish a transport to `remote` over `network`, or return the one
    /// that already exists.
    ///
    /// # Errors
    ///
    /// Fails with [`ManagerError::UnknownNetwork`] if no client serves
    /// `network`, and with [`ManagerError::Save`] naming the remote, the
    /// network and the cause if dialing or settling fails.
    pub async fn save_transport(
        &self,
        remote: PubKey,
        network: NetworkType,
        label: Label,
    ) -> Result<Arc<ManagedTransport>, ManagerError> {
        if self.is_closed() {
            return Err(ManagerError::Closed);
        }
        let client = self
            .client(network)
            .ok_or(ManagerError::UnknownNetwork(network))?;

        let mut attempt = 1;
        loop {
            match self.inner.save_transport(&client, remote, label).await {
                Ok(mt) => return Ok(mt),
                Err(TransportError::NotServing)
                    if attempt < SAVE_TRANSPORT_RETRIES && !self.is_closed() =>
                {
                    debug!(remote = %remote, network = %network, attempt, "Transport stopped serving while saving, retrying");
                    attempt += 1;
                }
                Err(source) => {
                    return Err(ManagerError::Save {
                        remote,
                        network,
                        source,
                    });
                }
            }
        }
    }

    /// Remove a transport: deregister it on a best-effort basis, then close
    /// it and drop it locally.
    pub async fn delete_transport(&self, id: Uuid) {
        if self.is_closed() {
            return;
        }
        let removed = self.inner.transports.write().remove(&id);
        if let Some(mt) = removed {
            mt.close().await;
            debug!(tp_id = %id, "Deleted transport");
        }
    }

    /// Next packet from any transport.
    ///
    /// Returns [`ManagerError::NotServing`] once the manager is closed and
    /// the queue is drained.
    pub async fn read_packet(&self) -> Result<Packet, ManagerError> {
        let mut rx = self.inner.read_rx.lock().await;
        let mut done = self.inner.done.subscribe();
        if !*done.borrow() {
            tokio::select! {
                packet = rx.recv() => return packet.ok_or(ManagerError::NotServing),
                _ = done.wait_for(|d| *d) => {}
            }
        }
        rx.try_recv().map_err(|_| ManagerError::NotServing)
    }

    /// Transport with the given ID.
    pub fn transport(&self, id: &Uuid) -> Option<Arc<ManagedTransport>> {
        self.inner.transports.read().get(id).cloned()
    }

    /// Transport to `remote` over `network`.
    pub fn transport_to(
        &self,
        remote: &PubKey,
        network: NetworkType,
    ) -> Result<Arc<ManagedTransport>, ManagerError> {
        if !self.is_known_network(network) {
            return Err(ManagerError::UnknownNetwork(network));
        }
        let id = make_transport_id(self.local_pk(), *remote, network);
        self.transport(&id).ok_or(ManagerError::NotFound)
    }

    /// Transports carrying `label`.
    pub fn transports_by_label(&self, label: Label) -> Vec<Arc<ManagedTransport>> {
        self.inner
            .transports
            .read()
            .values()
            .filter(|mt| mt.label() == label)
            .cloned()
            .collect()
    }

    /// Visit transports until `walk` returns `false`.
    pub fn walk_transports(&self, mut walk: impl FnMut(&Arc<ManagedTransport>) -> bool) {
        for mt in self.inner.transports.read().values() {
            if !walk(mt) {
                break;
            }
        }
    }

    /// Number of transports in the table.
    pub fn transport_count(&self) -> usize {
        self.inner.transports.read().len()
    }

    /// Summaries of all transports.
    pub fn summaries(&self) -> Vec<TransportSummary> {
        self.inner
            .transports
            .read()
            .values()
            .map(|mt| mt.summary())
            .collect()
    }

    /// Close every transport and client and stop background work. Later
    /// calls do nothing.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.done.send_replace(true);

        let transports: Vec<_> = self.inner.transports.write().drain().map(|(_, mt)| mt).collect();
        let statuses: Vec<_> = transports
            .iter()
            .map(|mt| super::Status {
                id: mt.id(),
                is_up: false,
            })
            .collect();
        futures::future::join_all(transports.iter().map(|mt| mt.close())).await;

        let clients: Vec<_> = self.inner.clients.read().values().cloned().collect();
        for client in clients {
            client.close().await;
        }
        if let Err(e) = self.inner.tpd.update_statuses(&statuses).await {
            warn!(error = %e, "Failed to push final transport statuses");
        }

        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Transport manager task failed");
            }
        }
        self.inner.read_tx.lock().take();
        info!(pk = %self.local_pk(), "Transport manager closed");
    }
}

impl ManagerInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn dial_lock(&self, id: Uuid) -> Arc<Mutex<()>> {
        Arc::clone(self.dial_locks.lock().entry(id).or_default())
    }

    fn release_dial_lock(&self, id: &Uuid, lock: Arc<Mutex<()>>) {
        let mut locks = self.dial_locks.lock();
        drop(lock);
        // The map holds one reference; drop the slot once nobody else waits.
        if locks.get(id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(id);
        }
    }

    fn live_transport(&self, id: &Uuid) -> Option<Arc<ManagedTransport>> {
        self.transports
            .read()
            .get(id)
            .filter(|mt| !mt.is_closed())
            .cloned()
    }

    fn new_transport(
        &self,
        client: &Arc<dyn NetworkClient>,
        remote: PubKey,
        label: Label,
    ) -> Arc<ManagedTransport> {
        Arc::new(ManagedTransport::new(ManagedTransportConfig {
            client: Arc::clone(client),
            keys: self.keys.clone(),
            tpd: Arc::clone(&self.tpd),
            log_store: Arc::clone(&self.log_store),
            remote,
            label,
            rehome_grace: self.config.rehome_grace,
        }))
    }

    fn read_tx(&self) -> Option<mpsc::Sender<Packet>> {
        self.read_tx.lock().clone()
    }

    async fn insert_and_serve(&self, mt: &Arc<ManagedTransport>) -> Result<(), TransportError> {
        let Some(tx) = self.read_tx().filter(|_| !self.is_closed()) else {
            mt.close().await;
            return Err(TransportError::NotServing);
        };
        self.transports.write().insert(mt.id(), Arc::clone(mt));
        mt.serve(tx).await;
        Ok(())
    }

    async fn save_transport(
        &self,
        client: &Arc<dyn NetworkClient>,
        remote: PubKey,
        label: Label,
    ) -> Result<Arc<ManagedTransport>, TransportError> {
        let network = client.network_type();
        let id = make_transport_id(self.keys.pk(), remote, network);
        let lock = self.dial_lock(id);
        let result = async {
            let _guard = lock.lock().await;
            if let Some(mt) = self.live_transport(&id) {
                debug!(tp_id = %id, "Found existing transport");
                if !mt.is_up() {
                    mt.dial().await?;
                }
                return Ok(mt);
            }

            let mt = self.new_transport(client, remote, label);
            debug!(tp_id = %id, remote = %remote, network = %network, "Dialing transport");
            if let Err(e) = mt.dial().await {
                debug!(tp_id = %id, error = %e, "Failed to dial transport");
                mt.close().await;
                return Err(e);
            }
            self.insert_and_serve(&mt).await?;
            info!(tp_id = %id, remote = %remote, network = %network, "Saved transport");
            Ok(mt)
        }
        .await;
        self.release_dial_lock(&id, lock);
        result
    }

    async fn accept_transport(&self, conn: Arc<dyn TransportConn>) -> Result<(), ManagerError> {
        let network = conn.network_type();
        let remote = conn.remote_addr().pk;
        if self.is_closed() {
            let _ = conn.close().await;
            return Err(ManagerError::Closed);
        }
        let client = self.clients.read().get(&network).cloned();
        let Some(client) = client else {
            let _ = conn.close().await;
            return Err(ManagerError::UnknownNetwork(network));
        };

        let id = make_transport_id(self.keys.pk(), remote, network);
        let lock = self.dial_lock(id);
        let result = async {
            let _guard = lock.lock().await;
            match self.live_transport(&id) {
                Some(mt) => {
                    debug!(tp_id = %id, "Transport exists, re-homing onto accepted connection");
                    mt.accept(conn).await
                }
                None => {
                    let mt = self.new_transport(&client, remote, Label::User);
                    if let Err(e) = mt.accept(conn).await {
                        mt.close().await;
                        return Err(e);
                    }
                    self.insert_and_serve(&mt).await
                }
            }
        }
        .await;
        self.release_dial_lock(&id, lock);

        let source = match result {
            Ok(()) => {
                info!(tp_id = %id, remote = %remote, network = %network, "Accepted transport");
                return Ok(());
            }
            Err(source) => source,
        };
        Err(ManagerError::Save {
            remote,
            network,
            source,
        })
    }

    async fn accept_loop(self: Arc<Self>, listener: Arc<dyn TransportListener>, network: NetworkType) {
        let mut done = self.done.subscribe();
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = done.wait_for(|d| *d) => break,
            };
            let conn = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    debug!(network = %network, error = %e, "Stopped accepting transports");
                    break;
                }
            };
            debug!(network = %network, remote = %conn.remote_addr(), "Received transport request");
            let inner = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = inner.accept_transport(conn).await {
                    warn!(network = %network, error = %e, "Failed to accept transport");
                }
            });
        }
        listener.close().await;
    }

    async fn cleanup_loop(self: Arc<Self>) {
        let mut done = self.done.subscribe();
        let mut ticker = tokio::time::interval(self.config.cleanup_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = done.wait_for(|d| *d) => break,
            }
            let removed = {
                let mut transports = self.transports.write();
                let before = transports.len();
                transports.retain(|_, mt| !mt.is_closed());
                before - transports.len()
            };
            if removed > 0 {
                debug!(removed, "Deleted closed transport entries");
            }
        }
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut done = self.done.subscribe();
        loop {
            self.reconnect_persistent().await;
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
                _ = done.wait_for(|d| *d) => break,
            }
        }
    }

    async fn reconnect_persistent(&self) {
        let persistent = self.persistent.read().clone();
        for tp in persistent {
            if self.is_closed() {
                return;
            }
            let client = self.clients.read().get(&tp.network).cloned();
            let Some(client) = client else {
                warn!(remote = %tp.pk, network = %tp.network, "No client for persistent transport");
                continue;
            };
            let attempt = tokio::time::timeout(
                self.config.reconnect_timeout,
                self.save_transport(&client, tp.pk, Label::User),
            )
            .await;
            match attempt {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    warn!(remote = %tp.pk, network = %tp.network, error = %e, "Cannot connect to persistent remote")
                }
                Err(_) => {
                    warn!(remote = %tp.pk, network = %tp.network, "Persistent reconnect timed out")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Duplex;
    use crate::network::{Backend, GenericClient, GenericClientBuilder, PkTable};
    use crate::transport::{PacketType, settle_initiator};

    fn stcp_client(keys: &Keypair, table: PkTable) -> Arc<dyn NetworkClient> {
        let config = GenericClientBuilder::new().listen_addr("127.0.0.1:0").build();
        Arc::new(GenericClient::new(keys.clone(), Backend::Stcp(table), config))
    }

    struct Pair {
        a: Manager,
        b: Manager,
        ka: Keypair,
        kb: Keypair,
        tpd: Arc<MemoryTpd>,
    }

    async fn pair() -> Pair {
        pair_with(Keypair::generate(), Keypair::generate()).await
    }

    // Visor B listens on loopback; A's table points at it.
    async fn pair_with(ka: Keypair, kb: Keypair) -> Pair {
        let tpd = Arc::new(MemoryTpd::new());

        let b = Manager::new(ManagerBuilder::new(kb.clone()).tpd(tpd.clone()).build());
        let b_client = stcp_client(&kb, PkTable::default());
        b.add_client(b_client.clone()).await.unwrap();
        let b_addr = b_client.local_addr().unwrap().to_string();

        let a = Manager::new(ManagerBuilder::new(ka.clone()).tpd(tpd.clone()).build());
        a.add_client(stcp_client(&ka, PkTable::new([(kb.pk(), b_addr)])))
            .await
            .unwrap();
        a.ready().await.unwrap();
        Pair { a, b, ka, kb, tpd }
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
    async fn test_save_transport_over_stcp() {
        let p = pair().await;
        let mt = p
            .a
            .save_transport(p.kb.pk(), NetworkType::Stcp, Label::User)
            .await
            .unwrap();
        assert_eq!(mt.id(), make_transport_id(p.ka.pk(), p.kb.pk(), NetworkType::Stcp));

        eventually(|| p.b.transport(&mt.id()).is_some()).await;
        let remote_mt = p.b.transport_to(&p.ka.pk(), NetworkType::Stcp).unwrap();
        assert_eq!(remote_mt.id(), mt.id());

        let se = p.tpd.signed_entry(&mt.id()).unwrap();
        assert!(se.verify(&p.ka.pk()) && se.verify(&p.kb.pk()));

        mt.write_packet(&Packet::data(11, b"over the mesh").unwrap())
            .await
            .unwrap();
        let packet = p.b.read_packet().await.unwrap();
        assert_eq!(packet.packet_type(), PacketType::Data);
        assert_eq!(packet.route_id(), 11);
        assert_eq!(packet.payload(), b"over the mesh");

        let summaries = p.a.summaries();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].log.sent, 13);

        p.a.close().await;
        p.b.close().await;
    }

    #[tokio::test]
    async fn test_inbound_connection_rehomes_live_transport() {
        let (k1, k2) = (Keypair::generate(), Keypair::generate());
        // B is the upper edge, so a fresh connection supersedes its current one.
        let (ka, kb) = if k1.pk() < k2.pk() { (k1, k2) } else { (k2, k1) };
        let p = pair_with(ka, kb).await;
        let mt = p
            .a
            .save_transport(p.kb.pk(), NetworkType::Stcp, Label::User)
            .await
            .unwrap();
        eventually(|| p.b.transport(&mt.id()).is_some_and(|t| t.is_up())).await;
        let remote_mt = p.b.transport(&mt.id()).unwrap();
        assert!(!remote_mt.is_least_significant_edge());

        let client = p.a.client(NetworkType::Stcp).unwrap();
        let conn = client.dial(p.kb.pk(), TRANSPORT_PORT).await.unwrap();
        settle_initiator(conn.as_ref(), &p.ka).await.unwrap();
        let packet = Packet::data(5, b"rehomed").unwrap();
        conn.write_all(packet.as_bytes()).await.unwrap();

        let got = p.b.read_packet().await.unwrap();
        assert_eq!(got.route_id(), 5);
        assert_eq!(got.payload(), b"rehomed");
        assert_eq!(p.b.transport_count(), 1);
        assert!(Arc::ptr_eq(&remote_mt, &p.b.transport(&mt.id()).unwrap()));
        assert!(remote_mt.is_up());

        p.a.close().await;
        p.b.close().await;
    }

    #[tokio::test]
    async fn test_concurrent_saves_yield_one_transport() {
        let p = pair().await;
        let saves = (0..8).map(|_| p.a.save_transport(p.kb.pk(), NetworkType::Stcp, Label::User));
        let results = futures::future::join_all(saves).await;

        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
        }
        assert_eq!(p.a.transport_count(), 1);
        let mut walked = Vec::new();
        p.a.walk_transports(|mt| {
            walked.push(mt.id());
            true
        });
        assert_eq!(walked, vec![first.id()]);
        eventually(|| p.b.transport_count() == 1).await;

        p.a.close().await;
        p.b.close().await;
    }

    #[tokio::test]
    async fn test_delete_with_discovery_down() {
        let p = pair().await;
        let mt = p
            .a
            .save_transport(p.kb.pk(), NetworkType::Stcp, Label::User)
            .await
            .unwrap();
        p.tpd.set_offline(true);

        p.a.delete_transport(mt.id()).await;
        assert!(mt.is_closed());
        assert!(p.a.transport(&mt.id()).is_none());
        assert_eq!(p.a.transport_count(), 0);

        p.tpd.set_offline(false);
        p.a.close().await;
        p.b.close().await;
    }

    #[tokio::test]
    async fn test_missing_address_fails_without_retry() {
        let p = pair().await;
        let stranger = Keypair::generate().pk();
        let err = p
            .a
            .save_transport(stranger, NetworkType::Stcp, Label::User)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(err.to_string().contains(&stranger.to_string()));
        assert_eq!(p.a.transport_count(), 0);

        assert!(matches!(
            p.a.save_transport(stranger, NetworkType::Sudph, Label::User).await,
            Err(ManagerError::UnknownNetwork(NetworkType::Sudph))
        ));
        p.a.close().await;
        p.b.close().await;
    }

    #[tokio::test]
    async fn test_closed_manager_stops_serving() {
        let p = pair().await;
        p.a.serve();
        assert_eq!(p.a.networks(), vec![NetworkType::Stcp]);

        tokio::join!(p.a.close(), p.a.close());
        assert!(matches!(p.a.read_packet().await, Err(ManagerError::NotServing)));
        assert!(matches!(
            p.a.save_transport(p.kb.pk(), NetworkType::Stcp, Label::User).await,
            Err(ManagerError::Closed)
        ));
        assert!(matches!(
            p.a.add_client(stcp_client(&p.ka, PkTable::default())).await,
            Err(ManagerError::Closed)
        ));
        p.b.close().await;
    }

    #[tokio::test]
    async fn test_init_clients_from_factory() {
        let keys = Keypair::generate();
        let mut factory = ClientFactory::new(keys.clone());
        factory.stcp_addr = "127.0.0.1:0".into();
        factory.resolver = Some(Arc::new(crate::network::MemoryResolver::new()));
        factory.stcpr_addr = "127.0.0.1:0".into();
        factory.sudph_addr = "127.0.0.1:0".into();

        let manager = Manager::new(ManagerBuilder::new(keys).build());
        manager.init_clients(&factory).await.unwrap();
        manager.ready().await.unwrap();
        assert_eq!(
            manager.networks(),
            vec![NetworkType::Stcp, NetworkType::Stcpr, NetworkType::Sudph]
        );
        assert!(!manager.is_known_network(NetworkType::Dmsg));
        manager.close().await;
    }

    #[tokio::test]
    async fn test_persistent_transport_is_established() {
        let p = pair().await;
        p.a.set_persistent(vec![PersistentTransport {
            pk: p.kb.pk(),
            network: NetworkType::Stcp,
        }]);
        p.a.serve();
        eventually(|| p.a.transport_count() == 1).await;
        assert_eq!(p.a.transports_by_label(Label::User).len(), 1);

        p.a.close().await;
        p.b.close().await;
    }
}
