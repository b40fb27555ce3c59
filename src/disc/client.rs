//! Discovery client contract and an in-process implementation.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::{DiscEntry, DiscoveryError};
use crate::crypto::{PubKey, SecKey};

/// Client of the relay discovery service.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    /// Fetch the entry published by `pk`.
    async fn entry(&self, pk: &PubKey) -> Result<DiscEntry, DiscoveryError>;

    /// Publish a signed entry.
    async fn post_entry(&self, entry: &DiscEntry) -> Result<(), DiscoveryError>;

    /// Entries of relay servers with free sessions.
    async fn available_servers(&self) -> Result<Vec<DiscEntry>, DiscoveryError>;

    /// Advance, re-sign and publish an existing entry.
    ///
    /// A wrong-sequence rejection is resolved against the stored entry: if
    /// the stored copy is newer the update is dropped, otherwise the update
    /// is retried one past the stored sequence.
    async fn put_entry(&self, sk: &SecKey, entry: &mut DiscEntry) -> Result<(), DiscoveryError> {
        republish(self, sk, entry).await
    }
}

pub(crate) async fn republish<C: DiscoveryClient + ?Sized>(
    client: &C,
    sk: &SecKey,
    entry: &mut DiscEntry,
) -> Result<(), DiscoveryError> {
    entry.advance();
    loop {
        entry.sign(sk)?;
        match client.post_entry(entry).await {
            Ok(()) => return Ok(()),
            Err(DiscoveryError::WrongSequence) => {}
            Err(e) => {
                entry.sequence -= 1;
                return Err(e);
            }
        }
        let stored = client.entry(&entry.static_pk).await?;
        if stored.timestamp > entry.timestamp {
            entry.sequence = stored.sequence;
            return Ok(());
        }
        debug!(pk = %entry.static_pk, stored = stored.sequence, "Retrying entry update with next sequence");
        entry.sequence = stored.sequence + 1;
    }
}

/// Discovery held in memory, shared by every clone.
///
/// Applies the same validation as the real service, so clients exercise
/// their sequence and signature handling against it.
#[derive(Clone, Default)]
pub struct MemoryDiscovery {
    entries: Arc<RwLock<HashMap<PubKey, DiscEntry>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryDiscovery {
    /// Create an empty discovery.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the service were unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no entry is stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> Result<(), DiscoveryError> {
        if self.offline.load(Ordering::Acquire) {
            return Err(DiscoveryError::Unavailable("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DiscoveryClient for MemoryDiscovery {
    async fn entry(&self, pk: &PubKey) -> Result<DiscEntry, DiscoveryError> {
        self.check_online()?;
        self.entries
            .read()
            .get(pk)
            .cloned()
            .ok_or(DiscoveryError::NotFound)
    }

    async fn post_entry(&self, entry: &DiscEntry) -> Result<(), DiscoveryError> {
        self.check_online()?;
        entry.validate()?;
        entry.verify_signature()?;

        let mut entries = self.entries.write();
        match entries.get(&entry.static_pk) {
            Some(old) if entry.sequence != old.sequence + 1 => {
                return Err(DiscoveryError::WrongSequence);
            }
            Some(old) if entry.timestamp < old.timestamp => {
                return Err(DiscoveryError::Validation(
                    "advertised entry timestamp is not greater than previous".into(),
                ));
            }
            None if entry.sequence != 0 => return Err(DiscoveryError::NonZeroSequence),
            _ => {}
        }
        entries.insert(entry.static_pk, entry.clone());
        Ok(())
    }

    async fn available_servers(&self) -> Result<Vec<DiscEntry>, DiscoveryError> {
        self.check_online()?;
        let servers: Vec<DiscEntry> = self
            .entries
            .read()
            .values()
            .filter(|e| e.server.as_ref().is_some_and(|s| s.available_sessions > 0))
            .cloned()
            .collect();
        if servers.is_empty() {
            return Err(DiscoveryError::NoAvailableServers);
        }
        Ok(servers)
    }
}
