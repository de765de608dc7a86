//! Result cache with pluggable backends and single-flight deduplication.
//!
//! The cache stores successful task results keyed by a stable fingerprint of
//! `(task name, arguments)`. TTL is evaluated at read time, so one entry can
//! serve callers with different freshness requirements. Two backends:
//!
//! - **Memory**: process-local map with an optional LRU bound
//!   (`result_cache_max_entries`).
//! - **Filesystem**: one file per key, sharded by key hash under
//!   `result_cache_path`; writes go to a temp file and are renamed into
//!   place, and corrupt or missing files read as misses.
//!
//! Single-flight ([`InFlightMap`]) is always in-memory and scoped to one
//! runtime: concurrent dispatches sharing a cache key elect one leader, and
//! followers wait for its outcome instead of executing.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::watch;

use crate::error::{Error, Result};
use crate::value::TaskValue;

/// Keyed store for task results. Implementations lock internally; callers
/// never synchronize.
pub trait ResultCache: Send + Sync {
    /// Returns the cached value for `key` if it was stored within `ttl`.
    ///
    /// # Errors
    ///
    /// Returns a [`Error::Cache`] only for backend faults; stale, missing,
    /// and unreadable entries are misses (`Ok(None)`).
    fn get(&self, key: &str, ttl: Duration) -> Result<Option<TaskValue>>;

    /// Stores `value` under `key` with the current timestamp.
    ///
    /// # Errors
    ///
    /// Returns a [`Error::Cache`] when the backend cannot persist the entry.
    fn set(&self, key: &str, value: &TaskValue) -> Result<()>;
}

struct MemoryEntry {
    stored: Instant,
    value: TaskValue,
    last_used: u64,
}

struct MemoryInner {
    entries: HashMap<String, MemoryEntry>,
    tick: u64,
}

/// In-memory result cache with optional LRU eviction on insert.
pub struct InMemoryResultCache {
    inner: Mutex<MemoryInner>,
    max_entries: Option<usize>,
}

impl InMemoryResultCache {
    /// Creates a cache, optionally bounded to `max_entries` live entries.
    #[must_use]
    pub fn new(max_entries: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(MemoryInner {
                entries: HashMap::new(),
                tick: 0,
            }),
            max_entries,
        }
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }

    /// True when the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResultCache for InMemoryResultCache {
    fn get(&self, key: &str, ttl: Duration) -> Result<Option<TaskValue>> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.tick += 1;
        let tick = inner.tick;
        let Some(entry) = inner.entries.get_mut(key) else {
            return Ok(None);
        };
        if entry.stored.elapsed() > ttl {
            return Ok(None);
        }
        entry.last_used = tick;
        Ok(Some(entry.value.clone()))
    }

    fn set(&self, key: &str, value: &TaskValue) -> Result<()> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.tick += 1;
        let tick = inner.tick;
        inner.entries.insert(
            key.to_string(),
            MemoryEntry {
                stored: Instant::now(),
                value: value.clone(),
                last_used: tick,
            },
        );
        if let Some(max) = self.max_entries {
            while inner.entries.len() > max {
                let Some(oldest) = inner
                    .entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_used)
                    .map(|(k, _)| k.clone())
                else {
                    break;
                };
                inner.entries.remove(&oldest);
            }
        }
        Ok(())
    }
}

/// On-disk envelope: stored timestamp plus the value.
#[derive(Serialize, Deserialize)]
struct DiskEntry {
    ts: f64,
    value: TaskValue,
}

/// Filesystem result cache. One file per key, two-level hash sharding.
pub struct FileSystemResultCache {
    root: PathBuf,
}

impl FileSystemResultCache {
    /// Creates a cache rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns a [`Error::Cache`] when the root cannot be created.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .map_err(|e| Error::cache_with_source("failed to create cache root", e))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(hex)
    }
}

impl ResultCache for FileSystemResultCache {
    fn get(&self, key: &str, ttl: Duration) -> Result<Option<TaskValue>> {
        let path = self.path_for(key);
        let Ok(bytes) = std::fs::read(&path) else {
            return Ok(None);
        };
        // Corrupt entries read as misses; a later set overwrites them.
        let Ok(entry) = serde_json::from_slice::<DiskEntry>(&bytes) else {
            return Ok(None);
        };
        let now = unix_now();
        if now - entry.ts <= ttl.as_secs_f64() {
            Ok(Some(entry.value))
        } else {
            Ok(None)
        }
    }

    fn set(&self, key: &str, value: &TaskValue) -> Result<()> {
        let path = self.path_for(key);
        let parent = path.parent().ok_or_else(|| Error::cache("cache path has no parent"))?;
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::cache_with_source("failed to create cache shard", e))?;
        let entry = DiskEntry {
            ts: unix_now(),
            value: value.clone(),
        };
        let bytes = serde_json::to_vec(&entry)
            .map_err(|e| Error::cache_with_source("failed to encode cache entry", e))?;
        write_atomic(&path, &bytes)
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Write-to-temp then rename, so readers never observe a partial entry.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_extension(format!("tmp.{}.{n}", std::process::id()));
    std::fs::write(&tmp, bytes)
        .map_err(|e| Error::cache_with_source("failed to write cache entry", e))?;
    std::fs::rename(&tmp, path).map_err(|e| {
        let _ = std::fs::remove_file(&tmp);
        Error::cache_with_source("failed to publish cache entry", e)
    })
}

/// Outcome shared between a single-flight leader and its followers.
pub type FlightOutcome = std::result::Result<TaskValue, String>;

type FlightReceiver = watch::Receiver<Option<FlightOutcome>>;
type FlightTable = Arc<Mutex<HashMap<String, FlightReceiver>>>;

/// Result of claiming a cache key for execution.
pub enum FlightClaim {
    /// This dispatch executes; it must resolve the guard.
    Leader(FlightGuard),
    /// Another dispatch with the same key is executing; wait on the channel.
    Follower(FlightReceiver),
}

/// Leader-side handle for an in-flight execution. Completing (or dropping)
/// the guard releases every follower; a dropped, unresolved guard releases
/// them with an error so nobody waits forever.
pub struct FlightGuard {
    key: String,
    tx: Option<watch::Sender<Option<FlightOutcome>>>,
    table: FlightTable,
}

impl FlightGuard {
    /// Publishes the outcome to all followers and retires the flight.
    pub fn complete(mut self, outcome: FlightOutcome) {
        self.finish(outcome);
    }

    fn finish(&mut self, outcome: FlightOutcome) {
        if let Some(tx) = self.tx.take() {
            // Remove before broadcasting: claimers arriving after this point
            // must become fresh leaders, not observe a settled flight.
            self.table
                .lock()
                .expect("in-flight lock poisoned")
                .remove(&self.key);
            let _ = tx.send(Some(outcome));
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.finish(Err("in-flight execution abandoned".to_string()));
    }
}

/// Per-runtime single-flight table.
#[derive(Default)]
pub struct InFlightMap {
    table: FlightTable,
}

impl InFlightMap {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `key`: the first claimant becomes the leader, later claimants
    /// follow until the leader resolves.
    #[must_use]
    pub fn claim(&self, key: &str) -> FlightClaim {
        let mut table = self.table.lock().expect("in-flight lock poisoned");
        if let Some(rx) = table.get(key) {
            return FlightClaim::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        table.insert(key.to_string(), rx);
        FlightClaim::Leader(FlightGuard {
            key: key.to_string(),
            tx: Some(tx),
            table: Arc::clone(&self.table),
        })
    }
}

/// Waits for a leader's outcome.
pub async fn await_flight(mut rx: FlightReceiver) -> FlightOutcome {
    loop {
        if let Some(outcome) = rx.borrow_and_update().clone() {
            return outcome;
        }
        if rx.changed().await.is_err() {
            // Sender gone; the guard always broadcasts before release, so a
            // missing value here means the leader was torn down abruptly.
            return rx
                .borrow()
                .clone()
                .unwrap_or_else(|| Err("in-flight execution abandoned".to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_cache_hits_within_ttl() {
        let cache = InMemoryResultCache::new(None);
        cache.set("k", &json!(42)).unwrap();
        assert_eq!(cache.get("k", Duration::from_secs(60)).unwrap(), Some(json!(42)));
    }

    #[test]
    fn memory_cache_expires_by_ttl_at_read_time() {
        let cache = InMemoryResultCache::new(None);
        cache.set("k", &json!(1)).unwrap();
        std::thread::sleep(Duration::from_millis(15));
        assert_eq!(cache.get("k", Duration::from_millis(1)).unwrap(), None);
        // The same entry still serves a longer TTL.
        assert_eq!(cache.get("k", Duration::from_secs(60)).unwrap(), Some(json!(1)));
    }

    #[test]
    fn memory_cache_evicts_least_recently_used() {
        let cache = InMemoryResultCache::new(Some(2));
        cache.set("a", &json!(1)).unwrap();
        cache.set("b", &json!(2)).unwrap();
        // Touch "a" so "b" becomes the eviction candidate.
        let _ = cache.get("a", Duration::from_secs(60)).unwrap();
        cache.set("c", &json!(3)).unwrap();

        assert_eq!(cache.len(), 2);
        assert!(cache.get("a", Duration::from_secs(60)).unwrap().is_some());
        assert!(cache.get("b", Duration::from_secs(60)).unwrap().is_none());
        assert!(cache.get("c", Duration::from_secs(60)).unwrap().is_some());
    }

    #[test]
    fn filesystem_cache_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSystemResultCache::new(dir.path()).unwrap();
        cache.set("key", &json!({"n": 7})).unwrap();
        assert_eq!(
            cache.get("key", Duration::from_secs(60)).unwrap(),
            Some(json!({"n": 7}))
        );
        assert_eq!(cache.get("other", Duration::from_secs(60)).unwrap(), None);
    }

    #[test]
    fn filesystem_cache_tolerates_corrupt_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSystemResultCache::new(dir.path()).unwrap();
        cache.set("key", &json!(1)).unwrap();

        let path = cache.path_for("key");
        std::fs::write(&path, b"not json").unwrap();
        assert_eq!(cache.get("key", Duration::from_secs(60)).unwrap(), None);
    }

    #[tokio::test]
    async fn single_flight_leader_releases_followers() {
        let map = InFlightMap::new();
        let FlightClaim::Leader(guard) = map.claim("k") else {
            panic!("first claim must lead");
        };
        let FlightClaim::Follower(rx) = map.claim("k") else {
            panic!("second claim must follow");
        };

        let waiter = tokio::spawn(await_flight(rx));
        guard.complete(Ok(json!("shared")));

        assert_eq!(waiter.await.unwrap(), Ok(json!("shared")));
        // Flight retired: the key can be claimed fresh.
        assert!(matches!(map.claim("k"), FlightClaim::Leader(_)));
    }

    #[tokio::test]
    async fn dropped_leader_fails_followers_instead_of_hanging() {
        let map = InFlightMap::new();
        let FlightClaim::Leader(guard) = map.claim("k") else {
            panic!("first claim must lead");
        };
        let FlightClaim::Follower(rx) = map.claim("k") else {
            panic!("second claim must follow");
        };

        drop(guard);
        let outcome = await_flight(rx).await;
        assert!(outcome.is_err());
    }
}
