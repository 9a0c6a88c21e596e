//! Storage backends and the cache/write-coalescing layer.
//!
//! Everything the dashboard persists flows through [`CachedStore`], which
//! mirrors the backend in memory and coalesces rapid writes to the same key
//! into a single backend write after a quiet period. The backend itself is
//! behind the [`StorageBackend`] trait: a slow, quota-limited, asynchronous
//! key-value store in the shape of extension storage (`get`/`set`/`remove`/
//! `clear` plus a byte-usage query).
//!
//! Failure policy: the cache is authoritative for the running session.
//! Backend read errors degrade to the caller's default, write errors are
//! logged and never rolled back or retried; only a process restart can lose
//! what the backend missed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Quota applied when `TABULA_QUOTA_BYTES` is unset (extension-storage sized).
pub const DEFAULT_QUOTA_BYTES: u64 = 5 * 1024 * 1024;

/// Quiet period applied when `TABULA_DEBOUNCE_MS` is unset.
pub const DEFAULT_DEBOUNCE_MS: u64 = 500;

/// Version stamped into export bundles.
pub const EXPORT_VERSION: u32 = 1;

static DEBOUNCE_MS: Lazy<u64> = Lazy::new(|| {
    std::env::var("TABULA_DEBOUNCE_MS")
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value >= 10)
        .unwrap_or(DEFAULT_DEBOUNCE_MS)
});

fn quota_from_env() -> u64 {
    std::env::var("TABULA_QUOTA_BYTES")
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_QUOTA_BYTES)
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("storage quota exceeded: {used} of {quota} bytes")]
    QuotaExceeded { used: u64, quota: u64 },
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serde(String),
}

/// The one error class meant for direct user display.
#[derive(Debug, thiserror::Error)]
pub enum ImportError {
    #[error("import bundle is missing its `data` object")]
    MissingData,
}

/// Asynchronous key-value backend contract.
///
/// Implementations are slow relative to the cache and enforce a byte quota
/// across all entries. Batch operations are not transactional beyond what
/// the implementation itself provides.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fetch the named keys; `None` means "all keys". Missing keys are
    /// simply absent from the result.
    async fn get(&self, keys: Option<&[&str]>) -> Result<Map<String, Value>, BackendError>;

    /// Upsert every entry in the map. Fails wholesale with
    /// [`BackendError::QuotaExceeded`] when the result would exceed quota.
    async fn set(&self, entries: Map<String, Value>) -> Result<(), BackendError>;

    async fn remove(&self, keys: &[&str]) -> Result<(), BackendError>;

    async fn clear(&self) -> Result<(), BackendError>;

    /// Bytes currently attributed to stored entries (keys + serialized values).
    async fn bytes_in_use(&self) -> Result<u64, BackendError>;

    fn quota_bytes(&self) -> u64;
}

fn value_bytes(value: &Value) -> Result<u64, BackendError> {
    serde_json::to_vec(value)
        .map(|bytes| bytes.len() as u64)
        .map_err(|err| BackendError::Serde(err.to_string()))
}

fn usage_of(entries: &Map<String, Value>) -> Result<u64, BackendError> {
    let mut total = 0u64;
    for (key, value) in entries {
        total += key.len() as u64 + value_bytes(value)?;
    }
    Ok(total)
}

fn subset(entries: &Map<String, Value>, keys: Option<&[&str]>) -> Map<String, Value> {
    match keys {
        None => entries.clone(),
        Some(wanted) => {
            let mut out = Map::new();
            for key in wanted {
                if let Some(value) = entries.get(*key) {
                    out.insert((*key).to_string(), value.clone());
                }
            }
            out
        }
    }
}

/// In-memory backend. The default for tests and for embedders that bring
/// their own persistence on top of [`CachedStore::export_all`].
pub struct MemoryBackend {
    entries: RwLock<Map<String, Value>>,
    quota: u64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_quota(quota_from_env())
    }

    pub fn with_quota(quota: u64) -> Self {
        Self {
            entries: RwLock::new(Map::new()),
            quota,
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, keys: Option<&[&str]>) -> Result<Map<String, Value>, BackendError> {
        let entries = self.entries.read().await;
        Ok(subset(&entries, keys))
    }

    async fn set(&self, new_entries: Map<String, Value>) -> Result<(), BackendError> {
        let mut entries = self.entries.write().await;
        let mut merged = entries.clone();
        for (key, value) in new_entries {
            merged.insert(key, value);
        }
        let used = usage_of(&merged)?;
        if used > self.quota {
            return Err(BackendError::QuotaExceeded {
                used,
                quota: self.quota,
            });
        }
        *entries = merged;
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), BackendError> {
        let mut entries = self.entries.write().await;
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }

    async fn clear(&self) -> Result<(), BackendError> {
        self.entries.write().await.clear();
        Ok(())
    }

    async fn bytes_in_use(&self) -> Result<u64, BackendError> {
        usage_of(&*self.entries.read().await)
    }

    fn quota_bytes(&self) -> u64 {
        self.quota
    }
}

/// File-backed backend: one JSON object per store, rewritten through a
/// temp file + rename so a crash mid-write leaves the previous snapshot.
pub struct FileBackend {
    path: PathBuf,
    entries: RwLock<Map<String, Value>>,
    quota: u64,
}

impl FileBackend {
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, BackendError> {
        Self::open_with_quota(dir, quota_from_env()).await
    }

    pub async fn open_with_quota(dir: impl AsRef<Path>, quota: u64) -> Result<Self, BackendError> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|err| BackendError::Io(err.to_string()))?;
        let path = dir.join("store.json");
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<Map<String, Value>>(&bytes) {
                Ok(map) => map,
                Err(err) => {
                    // Keep serving; the corrupt file survives on disk until
                    // the first successful write replaces it.
                    warn!(
                        target: "tabula::store",
                        path = %path.display(),
                        error = %err,
                        "store file unreadable; starting from an empty snapshot"
                    );
                    Map::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(err) => return Err(BackendError::Io(err.to_string())),
        };
        Ok(Self {
            path,
            entries: RwLock::new(entries),
            quota,
        })
    }

    async fn persist(&self, entries: &Map<String, Value>) -> Result<(), BackendError> {
        let bytes =
            serde_json::to_vec(entries).map_err(|err| BackendError::Serde(err.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|err| BackendError::Io(err.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|err| BackendError::Io(err.to_string()))
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, keys: Option<&[&str]>) -> Result<Map<String, Value>, BackendError> {
        let entries = self.entries.read().await;
        Ok(subset(&entries, keys))
    }

    async fn set(&self, new_entries: Map<String, Value>) -> Result<(), BackendError> {
        let mut entries = self.entries.write().await;
        let mut merged = entries.clone();
        for (key, value) in new_entries {
            merged.insert(key, value);
        }
        let used = usage_of(&merged)?;
        if used > self.quota {
            return Err(BackendError::QuotaExceeded {
                used,
                quota: self.quota,
            });
        }
        self.persist(&merged).await?;
        *entries = merged;
        Ok(())
    }

    async fn remove(&self, keys: &[&str]) -> Result<(), BackendError> {
        let mut entries = self.entries.write().await;
        let mut pruned = entries.clone();
        for key in keys {
            pruned.remove(*key);
        }
        self.persist(&pruned).await?;
        *entries = pruned;
        Ok(())
    }

    async fn clear(&self) -> Result<(), BackendError> {
        let mut entries = self.entries.write().await;
        self.persist(&Map::new()).await?;
        entries.clear();
        Ok(())
    }

    async fn bytes_in_use(&self) -> Result<u64, BackendError> {
        usage_of(&*self.entries.read().await)
    }

    fn quota_bytes(&self) -> u64 {
        self.quota
    }
}

/// Backend usage snapshot for quota reporting.
#[derive(Debug, Clone, Serialize)]
pub struct StorageUsage {
    pub used_bytes: u64,
    pub quota_bytes: u64,
    pub percent_used: f64,
}

/// Everything the backend currently holds, plus provenance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportBundle {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    pub data: Map<String, Value>,
}

impl ExportBundle {
    /// Validates raw user-supplied JSON. Only the `data` object is
    /// required; `version` and `timestamp` fall back when absent.
    pub fn from_value(value: &Value) -> Result<Self, ImportError> {
        let obj = value.as_object().ok_or(ImportError::MissingData)?;
        let data = obj
            .get("data")
            .and_then(Value::as_object)
            .cloned()
            .ok_or(ImportError::MissingData)?;
        let version = obj
            .get("version")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(EXPORT_VERSION);
        let timestamp = obj
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse::<DateTime<Utc>>().ok())
            .unwrap_or_else(Utc::now);
        Ok(Self {
            version,
            timestamp,
            data,
        })
    }
}

struct StoreInner {
    backend: Arc<dyn StorageBackend>,
    cache: Mutex<HashMap<String, Value>>,
    /// Armed debounce slots: key -> generation of the newest write.
    pending: Mutex<HashMap<String, u64>>,
    generations: AtomicU64,
    debounce: Duration,
}

/// Cache/write-coalescing layer over a [`StorageBackend`].
///
/// Cheap to clone; all clones share the same cache and debounce table.
/// Readers always observe the latest `set` value immediately, regardless of
/// persistence timing. Non-immediate writes are persisted once per quiet
/// period with last-write-wins semantics; the debounce closes over the
/// fully-qualified key, never over "whatever key is current at flush time".
#[derive(Clone)]
pub struct CachedStore {
    inner: Arc<StoreInner>,
}

impl CachedStore {
    /// Quiet period from `TABULA_DEBOUNCE_MS` (default 500 ms).
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self::with_debounce(backend, Duration::from_millis(*DEBOUNCE_MS))
    }

    pub fn with_debounce(backend: Arc<dyn StorageBackend>, debounce: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                backend,
                cache: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
                debounce,
            }),
        }
    }

    pub fn debounce(&self) -> Duration {
        self.inner.debounce
    }

    /// Cached value for `key`, or a backend read on first touch. A key
    /// already cached is never re-read, even if stale relative to writes
    /// from outside this process: this is a single-writer cache. A backend
    /// error returns `default` without caching it, so a later call retries.
    pub async fn get(&self, key: &str, default: Value) -> Value {
        if let Some(value) = self.inner.cache.lock().await.get(key) {
            return value.clone();
        }
        match self.inner.backend.get(Some(&[key])).await {
            Ok(mut found) => {
                let value = found.remove(key).unwrap_or(default);
                self.inner
                    .cache
                    .lock()
                    .await
                    .insert(key.to_string(), value.clone());
                value
            }
            Err(err) => {
                warn!(
                    target: "tabula::store",
                    key,
                    error = %err,
                    "backend read failed; serving default"
                );
                default
            }
        }
    }

    /// Convenience for keys holding JSON objects (widget collections,
    /// template maps). Anything else degrades to an empty map.
    pub async fn get_map(&self, key: &str) -> Map<String, Value> {
        self.get(key, Value::Object(Map::new()))
            .await
            .as_object()
            .cloned()
            .unwrap_or_default()
    }

    /// Updates the cache synchronously, then persists. `immediate` awaits
    /// one backend write and cancels any pending debounce for the key;
    /// otherwise the per-key debounce is armed/reset and only the value
    /// present when the timer fires is persisted.
    pub async fn set(&self, key: &str, value: Value, immediate: bool) {
        self.inner
            .cache
            .lock()
            .await
            .insert(key.to_string(), value.clone());
        if immediate {
            self.inner.pending.lock().await.remove(key);
            let mut entries = Map::new();
            entries.insert(key.to_string(), value);
            if let Err(err) = self.inner.backend.set(entries).await {
                warn!(
                    target: "tabula::store",
                    key,
                    error = %err,
                    "immediate write failed; cache retains the value"
                );
            }
        } else {
            let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
            self.inner
                .pending
                .lock()
                .await
                .insert(key.to_string(), generation);
            let inner = Arc::clone(&self.inner);
            let key = key.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(inner.debounce).await;
                flush_if_current(&inner, &key, generation).await;
            });
        }
    }

    /// Removes from cache and backend together. Removal is never debounced.
    pub async fn remove(&self, key: &str) {
        self.inner.cache.lock().await.remove(key);
        self.inner.pending.lock().await.remove(key);
        if let Err(err) = self.inner.backend.remove(&[key]).await {
            warn!(
                target: "tabula::store",
                key,
                error = %err,
                "backend remove failed"
            );
        }
    }

    /// Wipes cache and backend. Import/reset flows only.
    pub async fn clear(&self) {
        self.inner.cache.lock().await.clear();
        self.inner.pending.lock().await.clear();
        if let Err(err) = self.inner.backend.clear().await {
            warn!(target: "tabula::store", error = %err, "backend clear failed");
        }
    }

    /// Persists every key with an armed debounce right now, in one batch.
    /// Shutdown and export path.
    pub async fn flush_all(&self) {
        let keys: Vec<String> = self.inner.pending.lock().await.drain().map(|(k, _)| k).collect();
        if keys.is_empty() {
            return;
        }
        let mut entries = Map::new();
        {
            let cache = self.inner.cache.lock().await;
            for key in keys {
                if let Some(value) = cache.get(&key) {
                    entries.insert(key, value.clone());
                }
            }
        }
        if entries.is_empty() {
            return;
        }
        debug!(target: "tabula::store", count = entries.len(), "flushing pending writes");
        if let Err(err) = self.inner.backend.set(entries).await {
            warn!(target: "tabula::store", error = %err, "flush failed");
        }
    }

    pub async fn usage(&self) -> StorageUsage {
        let quota_bytes = self.inner.backend.quota_bytes();
        let used_bytes = match self.inner.backend.bytes_in_use().await {
            Ok(bytes) => bytes,
            Err(err) => {
                warn!(target: "tabula::store", error = %err, "usage query failed");
                0
            }
        };
        let percent_used = if quota_bytes == 0 {
            0.0
        } else {
            used_bytes as f64 * 100.0 / quota_bytes as f64
        };
        StorageUsage {
            used_bytes,
            quota_bytes,
            percent_used,
        }
    }

    /// Flushes pending writes, then snapshots the entire backend.
    pub async fn export_all(&self) -> ExportBundle {
        self.flush_all().await;
        let data = match self.inner.backend.get(None).await {
            Ok(map) => map,
            Err(err) => {
                warn!(target: "tabula::store", error = %err, "export read failed");
                Map::new()
            }
        };
        ExportBundle {
            version: EXPORT_VERSION,
            timestamp: Utc::now(),
            data,
        }
    }

    /// Replaces the entire store with the bundle's contents and invalidates
    /// the cache. Callers are expected to reload their in-memory state.
    pub async fn import_all(&self, raw: &Value) -> Result<(), ImportError> {
        let bundle = ExportBundle::from_value(raw)?;
        self.clear().await;
        let count = bundle.data.len();
        if let Err(err) = self.inner.backend.set(bundle.data).await {
            warn!(target: "tabula::store", error = %err, "import write failed");
        }
        debug!(
            target: "tabula::store",
            version = bundle.version,
            keys = count,
            "import complete"
        );
        Ok(())
    }
}

async fn flush_if_current(inner: &Arc<StoreInner>, key: &str, generation: u64) {
    {
        let mut pending = inner.pending.lock().await;
        if pending.get(key) != Some(&generation) {
            // A newer write re-armed the timer, or an immediate write /
            // remove / clear already settled this key.
            return;
        }
        pending.remove(key);
    }
    let value = { inner.cache.lock().await.get(key).cloned() };
    let Some(value) = value else {
        return;
    };
    let mut entries = Map::new();
    entries.insert(key.to_string(), value);
    if let Err(err) = inner.backend.set(entries).await {
        warn!(
            target: "tabula::store",
            key,
            error = %err,
            "debounced write failed; cache retains the value"
        );
    }
}
