//! Per-transport traffic counters and where they are persisted.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

/// Log store errors.
#[derive(Debug, Error)]
pub enum LogStoreError {
    /// Reading or writing the store failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The stored data is malformed.
    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Byte counts of one transport at one point in time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Total received payload bytes.
    pub recv: u64,
    /// Total sent payload bytes.
    pub sent: u64,
}

/// Live traffic counters of a transport.
#[derive(Debug, Default)]
pub struct LogEntry {
    recv: AtomicU64,
    sent: AtomicU64,
}

impl LogEntry {
    /// Zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `n` received bytes.
    pub fn add_recv(&self, n: u64) {
        self.recv.fetch_add(n, Ordering::Relaxed);
    }

    /// Record `n` sent bytes.
    pub fn add_sent(&self, n: u64) {
        self.sent.fetch_add(n, Ordering::Relaxed);
    }

    /// Received bytes so far.
    pub fn recv_bytes(&self) -> u64 {
        self.recv.load(Ordering::Relaxed)
    }

    /// Sent bytes so far.
    pub fn sent_bytes(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    /// Zero both counters.
    pub fn reset(&self) {
        self.recv.store(0, Ordering::Relaxed);
        self.sent.store(0, Ordering::Relaxed);
    }

    /// Current counts.
    pub fn snapshot(&self) -> LogRecord {
        LogRecord {
            recv: self.recv_bytes(),
            sent: self.sent_bytes(),
        }
    }
}

impl From<LogRecord> for LogEntry {
    fn from(record: LogRecord) -> Self {
        Self {
            recv: AtomicU64::new(record.recv),
            sent: AtomicU64::new(record.sent),
        }
    }
}

impl Serialize for LogEntry {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

/// Where transport log records are kept.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Last record stored for `id`.
    async fn entry(&self, id: &Uuid) -> Result<Option<LogRecord>, LogStoreError>;

    /// Store `record` for `id`, replacing the previous one.
    async fn record(&self, id: &Uuid, record: LogRecord) -> Result<(), LogStoreError>;
}

/// In-process log store.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    entries: parking_lot::Mutex<HashMap<Uuid, LogRecord>>,
}

impl MemoryLogStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stored record of `id`.
    pub fn get(&self, id: &Uuid) -> Option<LogRecord> {
        self.entries.lock().get(id).copied()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn entry(&self, id: &Uuid) -> Result<Option<LogRecord>, LogStoreError> {
        Ok(self.entries.lock().get(id).copied())
    }

    async fn record(&self, id: &Uuid, record: LogRecord) -> Result<(), LogStoreError> {
        self.entries.lock().insert(*id, record);
        Ok(())
    }
}

/// Log store keeping every record in one JSON file.
#[derive(Debug)]
pub struct FileLogStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileLogStore {
    /// File name used inside the store directory.
    pub const FILE_NAME: &'static str = "transport_logs.json";

    /// Open a store in `dir`, creating the directory if needed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, LogStoreError> {
        tokio::fs::create_dir_all(dir.as_ref()).await?;
        let path = dir.as_ref().join(Self::FILE_NAME);
        debug!(path = %path.display(), "Opened transport log store");
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<HashMap<Uuid, LogRecord>, LogStoreError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn entry(&self, id: &Uuid) -> Result<Option<LogRecord>, LogStoreError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.get(id).copied())
    }

    async fn record(&self, id: &Uuid, record: LogRecord) -> Result<(), LogStoreError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        entries.insert(*id, record);

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&entries)?).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let entry = LogEntry::from(LogRecord { recv: 5, sent: 1 });
        entry.add_recv(10);
        entry.add_sent(3);
        assert_eq!(entry.snapshot(), LogRecord { recv: 15, sent: 4 });
        assert_eq!(
            serde_json::to_string(&entry).unwrap(),
            r#"{"recv":15,"sent":4}"#
        );
        entry.reset();
        assert_eq!(entry.snapshot(), LogRecord::default());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryLogStore::new();
        let id = Uuid::new_v4();
        assert_eq!(store.entry(&id).await.unwrap(), None);
        store.record(&id, LogRecord { recv: 1, sent: 2 }).await.unwrap();
        assert_eq!(
            store.entry(&id).await.unwrap(),
            Some(LogRecord { recv: 1, sent: 2 })
        );
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        {
            let store = FileLogStore::open(dir.path().join("logs")).await.unwrap();
            store.record(&a, LogRecord { recv: 7, sent: 8 }).await.unwrap();
            store.record(&b, LogRecord { recv: 1, sent: 0 }).await.unwrap();
            store.record(&a, LogRecord { recv: 9, sent: 8 }).await.unwrap();
        }
        let store = FileLogStore::open(dir.path().join("logs")).await.unwrap();
        assert!(store.path().exists());
        assert_eq!(
            store.entry(&a).await.unwrap(),
            Some(LogRecord { recv: 9, sent: 8 })
        );
        assert_eq!(
            store.entry(&b).await.unwrap(),
            Some(LogRecord { recv: 1, sent: 0 })
        );
        assert_eq!(store.entry(&Uuid::new_v4()).await.unwrap(), None);
    }
}
