//! Bookkeeping shared by relay clients and servers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use super::RelayError;
use crate::crypto::{Keypair, PubKey};
use crate::disc::{ClientInfo, DiscEntry, DiscoveryClient, DiscoveryError, ServerInfo};

/// Callback invoked with the remote key of an added or removed session.
pub type SessionCallback = Arc<dyn Fn(PubKey) + Send + Sync>;

/// Hooks fired when the session table changes.
#[derive(Clone, Default)]
pub struct SessionCallbacks {
    /// Called after a session is added.
    pub on_added: Option<SessionCallback>,
    /// Called after a session is removed.
    pub on_removed: Option<SessionCallback>,
}

impl fmt::Debug for SessionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCallbacks")
            .field("on_added", &self.on_added.is_some())
            .field("on_removed", &self.on_removed.is_some())
            .finish()
    }
}

/// Identity, discovery client and live sessions of a relay entity.
///
/// `S` is the session type: client sessions keyed by server key, or server
/// sessions keyed by client key.
pub struct EntityCommon<S> {
    keys: Keypair,
    disc: Arc<dyn DiscoveryClient>,
    sessions: RwLock<HashMap<PubKey, Arc<S>>>,
    entry: Mutex<Option<DiscEntry>>,
    callbacks: SessionCallbacks,
}

impl<S> EntityCommon<S> {
    /// Create the shared state.
    pub fn new(keys: Keypair, disc: Arc<dyn DiscoveryClient>, callbacks: SessionCallbacks) -> Self {
        Self {
            keys,
            disc,
            sessions: RwLock::new(HashMap::new()),
            entry: Mutex::new(None),
            callbacks,
        }
    }

    /// Local public key.
    pub fn pk(&self) -> PubKey {
        self.keys.pk()
    }

    /// Local identity.
    pub fn keys(&self) -> &Keypair {
        &self.keys
    }

    /// Discovery client.
    pub fn disc(&self) -> &Arc<dyn DiscoveryClient> {
        &self.disc
    }

    /// Session with `pk`, if any.
    pub async fn session(&self, pk: &PubKey) -> Option<Arc<S>> {
        self.sessions.read().await.get(pk).cloned()
    }

    /// Every live session.
    pub async fn sessions(&self) -> Vec<Arc<S>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Keys of every live session.
    pub async fn session_pks(&self) -> Vec<PubKey> {
        let mut pks: Vec<PubKey> = self.sessions.read().await.keys().copied().collect();
        pks.sort();
        pks
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Add a session, returning `false` if one already exists for `pk`.
    pub async fn set_session(&self, pk: PubKey, session: Arc<S>) -> bool {
        {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&pk) {
                return false;
            }
            sessions.insert(pk, session);
        }
        if let Some(cb) = &self.callbacks.on_added {
            cb(pk);
        }
        true
    }

    /// Remove the session with `pk`.
    pub async fn del_session(&self, pk: &PubKey) -> Option<Arc<S>> {
        let removed = self.sessions.write().await.remove(pk);
        if removed.is_some() {
            if let Some(cb) = &self.callbacks.on_removed {
                cb(*pk);
            }
        }
        removed
    }

    /// Remove the session with `pk` only if it is `session`.
    pub async fn del_session_if(&self, pk: &PubKey, session: &Arc<S>) -> bool {
        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(pk) {
                Some(current) if Arc::ptr_eq(current, session) => sessions.remove(pk).is_some(),
                _ => false,
            }
        };
        if removed {
            if let Some(cb) = &self.callbacks.on_removed {
                cb(*pk);
            }
        }
        removed
    }

    /// Remove every session.
    pub async fn take_sessions(&self) -> Vec<(PubKey, Arc<S>)> {
        let drained: Vec<_> = self.sessions.write().await.drain().collect();
        if let Some(cb) = &self.callbacks.on_removed {
            for (pk, _) in &drained {
                cb(*pk);
            }
        }
        drained
    }

    /// Publish the client entry listing the current sessions' servers.
    pub async fn update_client_entry(&self) -> Result<(), RelayError> {
        let delegated = self.session_pks().await;
        self.update_entry(
            |pk| DiscEntry::new_client(pk, 0, delegated.clone()),
            |entry| {
                entry.client = Some(ClientInfo {
                    delegated_servers: delegated.clone(),
                })
            },
        )
        .await
    }

    /// Publish the server entry.
    pub async fn update_server_entry(
        &self,
        address: String,
        available_sessions: i64,
    ) -> Result<(), RelayError> {
        self.update_entry(
            |pk| DiscEntry::new_server(pk, 0, address.clone(), available_sessions),
            |entry| {
                entry.server = Some(ServerInfo {
                    address: address.clone(),
                    available_sessions,
                })
            },
        )
        .await
    }

    async fn update_entry(
        &self,
        create: impl Fn(PubKey) -> DiscEntry,
        modify: impl Fn(&mut DiscEntry),
    ) -> Result<(), RelayError> {
        let mut cached = self.entry.lock().await;
        if cached.is_none() {
            match self.disc.entry(&self.pk()).await {
                Ok(entry) => *cached = Some(entry),
                Err(DiscoveryError::NotFound) => {
                    let mut entry = create(self.pk());
                    entry.sign(self.keys.sk())?;
                    self.disc.post_entry(&entry).await?;
                    debug!(pk = %self.pk(), "Posted new discovery entry");
                    *cached = Some(entry);
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        let Some(entry) = cached.as_mut() else {
            return Ok(());
        };
        modify(entry);
        if let Err(e) = self.disc.put_entry(self.keys.sk(), entry).await {
            // Refetch next time in case the stored copy moved on.
            *cached = None;
            return Err(e.into());
        }
        debug!(pk = %self.pk(), seq = entry.sequence, "Updated discovery entry");
        Ok(())
    }

    /// Entry of a relay client, with its delegated servers.
    pub async fn client_entry(&self, pk: &PubKey) -> Result<DiscEntry, RelayError> {
        let entry = self.lookup(pk).await?;
        match &entry.client {
            None => Err(RelayError::DiscEntryIsNotClient),
            Some(c) if c.delegated_servers.is_empty() => Err(RelayError::DiscEntryHasNoDelegated),
            Some(_) => Ok(entry),
        }
    }

    /// Entry of a relay server.
    pub async fn server_entry(&self, pk: &PubKey) -> Result<DiscEntry, RelayError> {
        let entry = self.lookup(pk).await?;
        if entry.server.is_none() {
            return Err(RelayError::DiscEntryIsNotServer);
        }
        Ok(entry)
    }

    async fn lookup(&self, pk: &PubKey) -> Result<DiscEntry, RelayError> {
        match self.disc.entry(pk).await {
            Ok(entry) => Ok(entry),
            Err(DiscoveryError::NotFound) => Err(RelayError::DiscEntryNotFound),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::disc::MemoryDiscovery;

    fn entity(disc: &MemoryDiscovery, callbacks: SessionCallbacks) -> EntityCommon<u32> {
        EntityCommon::new(Keypair::generate(), Arc::new(disc.clone()), callbacks)
    }

    #[tokio::test]
    async fn test_session_table_and_callbacks() {
        let added = Arc::new(AtomicUsize::new(0));
        let removed = Arc::new(AtomicUsize::new(0));
        let callbacks = SessionCallbacks {
            on_added: Some({
                let added = Arc::clone(&added);
                Arc::new(move |_: PubKey| {
                    added.fetch_add(1, Ordering::SeqCst);
                })
            }),
            on_removed: Some({
                let removed = Arc::clone(&removed);
                Arc::new(move |_: PubKey| {
                    removed.fetch_add(1, Ordering::SeqCst);
                })
            }),
        };
        let ec = entity(&MemoryDiscovery::new(), callbacks);
        let pk = Keypair::generate().pk();

        let first = Arc::new(1);
        assert!(ec.set_session(pk, Arc::clone(&first)).await);
        assert!(!ec.set_session(pk, Arc::new(2)).await);
        assert_eq!(ec.session_count().await, 1);

        assert!(!ec.del_session_if(&pk, &Arc::new(1)).await);
        assert!(ec.del_session_if(&pk, &first).await);
        assert!(ec.del_session(&pk).await.is_none());

        assert_eq!(added.load(Ordering::SeqCst), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_client_entry_post_then_put() {
        let disc = MemoryDiscovery::new();
        let ec = entity(&disc, SessionCallbacks::default());

        ec.update_client_entry().await.unwrap();
        assert_eq!(disc.entry(&ec.pk()).await.unwrap().sequence, 0);

        let server = Keypair::generate().pk();
        ec.set_session(server, Arc::new(0)).await;
        ec.update_client_entry().await.unwrap();

        let stored = disc.entry(&ec.pk()).await.unwrap();
        assert_eq!(stored.sequence, 1);
        assert_eq!(stored.delegated_servers(), &[server]);
    }

    #[tokio::test]
    async fn test_entry_lookup_errors() {
        let disc = MemoryDiscovery::new();
        let ec = entity(&disc, SessionCallbacks::default());
        let other = entity(&disc, SessionCallbacks::default());

        assert!(matches!(
            ec.client_entry(&other.pk()).await,
            Err(RelayError::DiscEntryNotFound)
        ));

        other.update_client_entry().await.unwrap();
        assert!(matches!(
            ec.client_entry(&other.pk()).await,
            Err(RelayError::DiscEntryHasNoDelegated)
        ));
        assert!(matches!(
            ec.server_entry(&other.pk()).await,
            Err(RelayError::DiscEntryIsNotServer)
        ));
    }
}
