//! Storage backends behind [`RendezvousStore`](super::RendezvousStore).
//!
//! Backends only ever see opaque slot ids and (possibly sealed) payload
//! strings; code validation, expiry policy and encoding live in the store.

use crate::error::{Result, TransferError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Polling interval while another process holds the store lock
const LOCK_RETRY: Duration = Duration::from_millis(10);
/// Give up acquiring the store lock after this long
const LOCK_TIMEOUT: Duration = Duration::from_secs(5);
/// A lock file older than this was left behind by a crashed writer
const LOCK_STALE: Duration = Duration::from_secs(30);

/// One stored slot as the backend sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecord {
    /// JSON for unsealed backends, base64 ciphertext for sealed ones
    pub payload: String,
    pub created_at_ms: u64,
    pub expires_at_ms: u64,
}

impl StoredRecord {
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

pub trait RendezvousBackend: Send + Sync {
    /// Whether payloads must be encrypted before they reach this backend
    const SEALED: bool;

    fn get(&self, slot: &str) -> impl Future<Output = Result<Option<StoredRecord>>> + Send;

    fn put(&self, slot: &str, record: StoredRecord) -> impl Future<Output = Result<()>> + Send;

    /// Store `record` unless a record live at `now_ms` already occupies `slot`.
    /// Returns whether it was stored; check and write are one atomic step.
    fn put_if_absent(
        &self,
        slot: &str,
        record: StoredRecord,
        now_ms: u64,
    ) -> impl Future<Output = Result<bool>> + Send;

    fn remove(&self, slot: &str) -> impl Future<Output = Result<bool>> + Send;

    /// Drop every record expired at `now_ms`, returning how many were removed
    fn remove_expired(&self, now_ms: u64) -> impl Future<Output = Result<usize>> + Send;
}

/// In-process ephemeral store
#[derive(Debug, Default)]
pub struct MemoryBackend {
    records: RwLock<HashMap<String, StoredRecord>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

impl RendezvousBackend for MemoryBackend {
    const SEALED: bool = false;

    async fn get(&self, slot: &str) -> Result<Option<StoredRecord>> {
        Ok(self.records.read().await.get(slot).cloned())
    }

    async fn put(&self, slot: &str, record: StoredRecord) -> Result<()> {
        self.records.write().await.insert(slot.to_string(), record);
        Ok(())
    }

    async fn put_if_absent(&self, slot: &str, record: StoredRecord, now_ms: u64) -> Result<bool> {
        let mut records = self.records.write().await;
        if records.get(slot).is_some_and(|r| !r.is_expired(now_ms)) {
            return Ok(false);
        }
        records.insert(slot.to_string(), record);
        Ok(true)
    }

    async fn remove(&self, slot: &str) -> Result<bool> {
        Ok(self.records.write().await.remove(slot).is_some())
    }

    async fn remove_expired(&self, now_ms: u64) -> Result<usize> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now_ms));
        Ok(before - records.len())
    }
}

/// Cross-process lock: a sibling file created exclusively, removed on drop
struct StoreLock {
    path: PathBuf,
}

impl StoreLock {
    async fn acquire(store: &Path) -> Result<Self> {
        let mut name = store.file_name().unwrap_or_default().to_os_string();
        name.push(".lock");
        let path = store.with_file_name(name);

        let started = Instant::now();
        loop {
            match tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(_) => return Ok(Self { path }),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    remove_stale_lock(&path).await;
                    if started.elapsed() >= LOCK_TIMEOUT {
                        return Err(TransferError::Backend(format!(
                            "store {} is locked by another process",
                            store.display()
                        )));
                    }
                    tokio::time::sleep(LOCK_RETRY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.path.display(), "Could not release store lock: {}", e);
        }
    }
}

async fn remove_stale_lock(path: &Path) {
    let Ok(modified) = tokio::fs::metadata(path).await.and_then(|m| m.modified()) else {
        return;
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default();
    if age >= LOCK_STALE && tokio::fs::remove_file(path).await.is_ok() {
        warn!(path = %path.display(), stale_secs = age.as_secs(), "Removed stale store lock");
    }
}

/// Persistent local store: a single JSON document on disk.
///
/// Writers in other processes are excluded by a `.lock` file next to it.
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    io_lock: Mutex<()>,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_all(&self) -> Result<HashMap<String, StoredRecord>> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(HashMap::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                TransferError::Backend(format!("corrupt store {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Both locks, held for one read-modify-write cycle
    async fn lock(&self) -> Result<(tokio::sync::MutexGuard<'_, ()>, StoreLock)> {
        let guard = self.io_lock.lock().await;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let lock = StoreLock::acquire(&self.path).await?;
        Ok((guard, lock))
    }

    async fn write_all(&self, records: &HashMap<String, StoredRecord>) -> Result<()> {
        let json = serde_json::to_vec_pretty(records)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

impl RendezvousBackend for FileBackend {
    const SEALED: bool = true;

    async fn get(&self, slot: &str) -> Result<Option<StoredRecord>> {
        let _guard = self.io_lock.lock().await;
        Ok(self.read_all().await?.remove(slot))
    }

    async fn put(&self, slot: &str, record: StoredRecord) -> Result<()> {
        let _locks = self.lock().await?;
        let mut records = self.read_all().await?;
        records.insert(slot.to_string(), record);
        self.write_all(&records).await
    }

    async fn put_if_absent(&self, slot: &str, record: StoredRecord, now_ms: u64) -> Result<bool> {
        let _locks = self.lock().await?;
        let mut records = self.read_all().await?;
        if records.get(slot).is_some_and(|r| !r.is_expired(now_ms)) {
            return Ok(false);
        }
        records.insert(slot.to_string(), record);
        self.write_all(&records).await?;
        Ok(true)
    }

    async fn remove(&self, slot: &str) -> Result<bool> {
        let _locks = self.lock().await?;
        let mut records = self.read_all().await?;
        let removed = records.remove(slot).is_some();
        if removed {
            self.write_all(&records).await?;
        }
        Ok(removed)
    }

    async fn remove_expired(&self, now_ms: u64) -> Result<usize> {
        let _locks = self.lock().await?;
        let mut records = self.read_all().await?;
        let before = records.len();
        records.retain(|_, r| !r.is_expired(now_ms));
        let removed = before - records.len();
        if removed > 0 {
            debug!(removed, path = %self.path.display(), "Swept expired records");
            self.write_all(&records).await?;
        }
        Ok(removed)
    }
}
