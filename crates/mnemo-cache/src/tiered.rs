//! Two-tier cache: bounded memory tier in front of an optional disk tier.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use mnemo_core::config::CacheConfig;
use mnemo_core::error::{MnemoError, Result};

use crate::disk::{DiskRecord, DiskTier};
use crate::memory::{CacheEntry, Lookup, MemoryTier};

/// Size charged for a value whose serialization probe fails.
pub const DEFAULT_ENTRY_SIZE: usize = 1024;

/// Construction options for [`TieredCache`].
#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub max_entries: usize,
    pub max_bytes: usize,
    /// Applied when `set` is called without a TTL.
    pub default_ttl: Option<Duration>,
    /// Directory of the disk tier. `None` keeps the cache memory-only.
    pub disk_dir: Option<PathBuf>,
    pub io_timeout: Duration,
}

impl CacheOptions {
    pub fn memory_only(max_entries: usize, max_bytes: usize) -> Self {
        Self {
            max_entries,
            max_bytes,
            default_ttl: None,
            disk_dir: None,
            io_timeout: Duration::from_millis(500),
        }
    }

    /// Options from the `[cache]` config section. A relative `cache_dir`
    /// resolves under `data_dir`.
    pub fn from_config(config: &CacheConfig, data_dir: &Path) -> Self {
        let disk_dir = config.persist.then(|| {
            let dir = PathBuf::from(&config.cache_dir);
            if dir.is_absolute() {
                dir
            } else {
                data_dir.join(dir)
            }
        });
        Self {
            max_entries: config.max_entries,
            max_bytes: config.max_bytes,
            default_ttl: config.default_ttl_secs.map(Duration::from_secs),
            disk_dir,
            io_timeout: Duration::from_millis(config.io_timeout_ms),
        }
    }

    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    pub fn with_disk(mut self, dir: impl Into<PathBuf>) -> Self {
        self.disk_dir = Some(dir.into());
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }
}

/// Read-only statistics snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub size_bytes: usize,
    pub max_entries: usize,
    pub max_bytes: usize,
    pub hits: u64,
    pub misses: u64,
    /// Hits served from the disk tier (and promoted to memory).
    pub disk_hits: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub persistent: bool,
    pub degraded: bool,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    disk_hits: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Generic key/value cache with LRU eviction, lazy TTL expiry and optional
/// disk persistence.
///
/// Disk trouble never surfaces to callers: the disk tier logs, degrades and
/// the cache keeps working from memory.
#[derive(Debug)]
pub struct TieredCache<V> {
    memory: Mutex<MemoryTier<V>>,
    disk: Option<DiskTier>,
    default_ttl: Option<Duration>,
    counters: Counters,
    /// Bumped under the memory lock by every `set`, `delete` and `clear`.
    generation: AtomicU64,
}

impl<V> TieredCache<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    pub fn new(options: CacheOptions) -> Self {
        let disk = options
            .disk_dir
            .map(|dir| DiskTier::open(dir, options.io_timeout));
        Self {
            memory: Mutex::new(MemoryTier::new(options.max_entries, options.max_bytes)),
            disk,
            default_ttl: options.default_ttl,
            counters: Counters::default(),
            generation: AtomicU64::new(0),
        }
    }

    /// Look up `key`: memory first, then disk with promotion on hit.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Utc::now();
        let generation = {
            let Ok(mut memory) = self.memory.lock() else {
                warn!("Cache memory tier lock poisoned; treating lookup as a miss");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            };
            match memory.get(key, now) {
                Lookup::Hit(value) => {
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(value);
                }
                Lookup::Expired => {
                    self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                    if let Some(disk) = &self.disk {
                        disk.remove(key);
                    }
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Lookup::Miss => {}
            }
            self.generation.load(Ordering::Acquire)
        };

        match self.read_disk(key, generation) {
            Some(value) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.counters.disk_hits.fetch_add(1, Ordering::Relaxed);
                Some(value)
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Disk lookup. A live record is promoted into memory with its original
    /// creation time and TTL, unless the cache was written to after the
    /// memory miss at `generation`.
    fn read_disk(&self, key: &str, generation: u64) -> Option<V> {
        let disk = self.disk.as_ref()?;
        let bytes = disk.read(key)?;

        let record: DiskRecord<V> = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(e) => {
                debug!(key, error = %e, "Corrupt disk cache record removed");
                disk.remove(key);
                return None;
            }
        };
        if record.key != key {
            debug!(key, stored = %record.key, "Disk cache record key mismatch removed");
            disk.remove(key);
            return None;
        }

        let ttl = record.ttl();
        let mut entry = CacheEntry::new(key, record.value, ttl, 0);
        entry.created_at = record.created_at;
        if entry.is_expired(Utc::now()) {
            self.counters.expirations.fetch_add(1, Ordering::Relaxed);
            disk.remove(key);
            return None;
        }

        let value = entry.value.clone();
        entry.size_bytes = estimate_size(key, &value);
        if let Ok(mut memory) = self.memory.lock() {
            let unchanged = self.generation.load(Ordering::Acquire) == generation;
            if unchanged && entry.size_bytes <= memory.max_bytes() {
                let evicted = memory.insert(entry);
                self.counters
                    .evictions
                    .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            }
        }
        Some(value)
    }

    /// Insert or replace `key`. `ttl` falls back to the configured default.
    ///
    /// Fails only when the value alone is larger than the byte budget.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) -> Result<()> {
        let key = key.into();
        let ttl = ttl.or(self.default_ttl);
        let size = estimate_size(&key, &value);

        let mut memory = self.memory.lock().map_err(MnemoError::lock)?;
        if size > memory.max_bytes() {
            return Err(MnemoError::CapacityExceeded(format!(
                "cache entry {key} is {size} bytes, budget is {} bytes",
                memory.max_bytes()
            )));
        }

        let entry = CacheEntry::new(key.clone(), value, ttl, size);
        let record = self.disk.as_ref().map(|_| DiskRecord {
            key: key.clone(),
            value: entry.value.clone(),
            created_at: entry.created_at,
            ttl_ms: ttl.map(|t| t.as_millis() as u64),
        });

        let evicted = memory.insert(entry);
        self.generation.fetch_add(1, Ordering::Release);
        // Queued under the memory lock so disk ops land in memory order.
        if let (Some(disk), Some(record)) = (&self.disk, record) {
            match serde_json::to_vec(&record) {
                Ok(bytes) => disk.write(&key, bytes),
                Err(e) => warn!(key = %key, error = %e, "Cannot serialize cache record for disk"),
            }
        }
        drop(memory);

        if !evicted.is_empty() {
            self.counters
                .evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            debug!(count = evicted.len(), "Evicted least recently used cache entries");
        }
        Ok(())
    }

    /// Remove `key` from both tiers. Returns whether memory held it.
    pub fn delete(&self, key: &str) -> bool {
        let mut memory = self.memory.lock().ok();
        let removed = memory
            .as_mut()
            .is_some_and(|memory| memory.remove(key).is_some());
        self.generation.fetch_add(1, Ordering::Release);
        if let Some(disk) = &self.disk {
            disk.remove(key);
        }
        drop(memory);
        removed
    }

    /// Empty both tiers.
    pub fn clear(&self) {
        let mut memory = self.memory.lock().ok();
        if let Some(memory) = memory.as_mut() {
            memory.clear();
        }
        self.generation.fetch_add(1, Ordering::Release);
        if let Some(disk) = &self.disk {
            disk.clear();
        }
        drop(memory);
    }

    /// Remove expired entries from both tiers. Returns the number of
    /// distinct keys removed.
    pub fn cleanup_expired(&self) -> usize {
        let mut removed = match self.memory.lock() {
            Ok(mut memory) => memory.purge_expired(Utc::now()),
            Err(_) => Vec::new(),
        };
        if let Some(disk) = &self.disk {
            for key in disk.sweep() {
                if !removed.contains(&key) {
                    removed.push(key);
                }
            }
        }
        self.counters
            .expirations
            .fetch_add(removed.len() as u64, Ordering::Relaxed);
        if !removed.is_empty() {
            debug!(count = removed.len(), "Expired cache entries removed");
        }
        removed.len()
    }

    /// Whether a live value exists for `key` in either tier. Does not touch
    /// recency or statistics.
    pub fn contains_key(&self, key: &str) -> bool {
        let in_memory = self
            .memory
            .lock()
            .map(|memory| memory.peek(key, Utc::now()))
            .unwrap_or(false);
        if in_memory {
            return true;
        }
        let Some(disk) = &self.disk else {
            return false;
        };
        disk.read(key)
            .and_then(|bytes| serde_json::from_slice::<DiskRecord<serde_json::Value>>(&bytes).ok())
            .is_some_and(|record| {
                record.key == key
                    && !crate::memory::is_expired(record.created_at, record.ttl(), Utc::now())
            })
    }

    /// Entries in the memory tier.
    pub fn len(&self) -> usize {
        self.memory.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Estimated bytes held by the memory tier.
    pub fn size_bytes(&self) -> usize {
        self.memory.lock().map(|m| m.bytes()).unwrap_or(0)
    }

    pub fn is_persistent(&self) -> bool {
        self.disk.is_some()
    }

    /// Block until queued disk writes have landed (bounded by the I/O
    /// timeout). A no-op for memory-only caches.
    pub fn flush(&self) -> bool {
        self.disk.as_ref().map(DiskTier::flush).unwrap_or(true)
    }

    pub fn stats(&self) -> CacheStats {
        let (entries, size_bytes, max_entries, max_bytes) = match self.memory.lock() {
            Ok(m) => (m.len(), m.bytes(), m.max_entries(), m.max_bytes()),
            Err(_) => (0, 0, 0, 0),
        };
        CacheStats {
            entries,
            size_bytes,
            max_entries,
            max_bytes,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            disk_hits: self.counters.disk_hits.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
            persistent: self.disk.is_some(),
            degraded: self.disk.as_ref().is_some_and(DiskTier::is_degraded),
        }
    }
}

/// Serialized length of the value plus the key, or [`DEFAULT_ENTRY_SIZE`]
/// when the value cannot be serialized.
fn estimate_size<V: Serialize>(key: &str, value: &V) -> usize {
    match serde_json::to_vec(value) {
        Ok(bytes) => bytes.len() + key.len(),
        Err(_) => DEFAULT_ENTRY_SIZE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn small_cache(max_entries: usize) -> TieredCache<String> {
        TieredCache::new(CacheOptions::memory_only(max_entries, 1024 * 1024))
    }

    #[test]
    fn test_set_and_get() {
        let cache = small_cache(10);
        cache.set("greeting", "hello".to_string(), None).unwrap();
        assert_eq!(cache.get("greeting"), Some("hello".to_string()));
        assert_eq!(cache.get("missing"), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_lru_eviction_respects_access_order() {
        let cache = small_cache(3);
        for i in 1..=5 {
            cache.set(format!("k{i}"), format!("v{i}"), None).unwrap();
        }
        // k3, k4, k5 remain. Touch k3 so k4 becomes least recently used.
        assert!(cache.get("k3").is_some());
        cache.set("k6", "v6".to_string(), None).unwrap();

        assert!(cache.get("k3").is_some());
        assert!(cache.get("k4").is_none());
        assert!(cache.get("k5").is_some());
        assert!(cache.get("k6").is_some());
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.stats().evictions, 3);
    }

    #[test]
    fn test_byte_budget() {
        let cache: TieredCache<String> = TieredCache::new(CacheOptions::memory_only(100, 64));
        cache.set("a", "x".repeat(20), None).unwrap();
        cache.set("b", "y".repeat(20), None).unwrap();
        cache.set("c", "z".repeat(20), None).unwrap();
        assert!(cache.size_bytes() <= 64);
        assert!(cache.get("a").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let cache: TieredCache<String> = TieredCache::new(CacheOptions::memory_only(10, 16));
        let err = cache.set("big", "x".repeat(100), None).unwrap_err();
        assert!(matches!(err, MnemoError::CapacityExceeded(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = small_cache(10);
        cache
            .set("short", "v".to_string(), Some(Duration::from_millis(50)))
            .unwrap();
        assert!(cache.get("short").is_some());
        std::thread::sleep(Duration::from_millis(80));
        assert!(cache.get("short").is_none());
        assert_eq!(cache.stats().expirations, 1);
    }

    #[test]
    fn test_default_ttl_applies() {
        let cache: TieredCache<u32> = TieredCache::new(
            CacheOptions::memory_only(10, 1024).with_default_ttl(Duration::from_millis(30)),
        );
        cache.set("a", 1, None).unwrap();
        cache.set("b", 2, Some(Duration::from_secs(60))).unwrap();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.cleanup_expired(), 1);
        assert_eq!(cache.get("b"), Some(2));
    }

    #[test]
    fn test_delete_and_clear() {
        let cache = small_cache(10);
        cache.set("a", "1".to_string(), None).unwrap();
        cache.set("b", "2".to_string(), None).unwrap();
        assert!(cache.delete("a"));
        assert!(!cache.delete("a"));
        assert!(!cache.contains_key("a"));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.size_bytes(), 0);
    }

    #[test]
    fn test_unserializable_value_uses_default_size() {
        // Maps with non-string keys fail JSON serialization.
        let cache: TieredCache<HashMap<(u8, u8), u8>> =
            TieredCache::new(CacheOptions::memory_only(10, 4096));
        let mut value = HashMap::new();
        value.insert((1, 2), 3);
        cache.set("tuple-keys", value, None).unwrap();
        assert_eq!(cache.size_bytes(), DEFAULT_ENTRY_SIZE);
    }

    #[test]
    fn test_disk_promotion_on_read() {
        let dir = tempfile::tempdir().unwrap();
        let cache: TieredCache<String> =
            TieredCache::new(CacheOptions::memory_only(2, 1024 * 1024).with_disk(dir.path()));
        cache.set("a", "alpha".to_string(), None).unwrap();
        cache.set("b", "beta".to_string(), None).unwrap();
        cache.set("c", "gamma".to_string(), None).unwrap();
        assert!(cache.flush());

        // "a" was evicted from memory but is still on disk.
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), Some("alpha".to_string()));
        assert_eq!(cache.stats().disk_hits, 1);

        // Promoted back into memory, so the next read is a memory hit.
        assert_eq!(cache.get("a"), Some("alpha".to_string()));
        assert_eq!(cache.stats().disk_hits, 1);
    }

    #[test]
    fn test_disk_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let cache: TieredCache<u64> =
                TieredCache::new(CacheOptions::memory_only(10, 1024).with_disk(dir.path()));
            cache.set("answer", 42, None).unwrap();
        }
        let cache: TieredCache<u64> =
            TieredCache::new(CacheOptions::memory_only(10, 1024).with_disk(dir.path()));
        assert!(cache.is_empty());
        assert!(cache.contains_key("answer"));
        assert_eq!(cache.get("answer"), Some(42));
    }

    #[test]
    fn test_disk_ttl_preserved_across_promotion() {
        let dir = tempfile::tempdir().unwrap();
        let cache: TieredCache<u64> =
            TieredCache::new(CacheOptions::memory_only(1, 1024).with_disk(dir.path()));
        cache.set("a", 1, Some(Duration::from_millis(60))).unwrap();
        cache.set("b", 2, None).unwrap();
        cache.flush();
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
    }

    #[test]
    fn test_corrupt_disk_file_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache: TieredCache<String> =
            TieredCache::new(CacheOptions::memory_only(10, 1024).with_disk(dir.path()));
        let path = dir.path().join(crate::disk::file_name("broken"));
        std::fs::write(&path, b"\x00\x01 garbage").unwrap();

        assert_eq!(cache.get("broken"), None);
        cache.flush();
        assert!(!path.exists());
    }

    #[test]
    fn test_key_mismatch_is_miss() {
        let dir = tempfile::tempdir().unwrap();
        let cache: TieredCache<String> =
            TieredCache::new(CacheOptions::memory_only(10, 1024).with_disk(dir.path()));
        let record = serde_json::json!({
            "key": "someone-else",
            "value": "v",
            "created_at": Utc::now(),
            "ttl_ms": null,
        });
        let path = dir.path().join(crate::disk::file_name("mine"));
        std::fs::write(&path, serde_json::to_vec(&record).unwrap()).unwrap();
        assert_eq!(cache.get("mine"), None);
    }

    #[test]
    fn test_degraded_disk_keeps_memory_working() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("file");
        std::fs::write(&blocker, b"x").unwrap();

        let cache: TieredCache<String> =
            TieredCache::new(CacheOptions::memory_only(10, 1024).with_disk(blocker.join("cache")));
        cache.set("a", "1".to_string(), None).unwrap();
        assert_eq!(cache.get("a"), Some("1".to_string()));
        assert_eq!(cache.get("missing"), None);
        assert!(cache.stats().degraded);
    }

    #[test]
    fn test_cleanup_expired_counts_distinct_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cache: TieredCache<u64> =
            TieredCache::new(CacheOptions::memory_only(10, 1024).with_disk(dir.path()));
        cache.set("a", 1, Some(Duration::from_millis(20))).unwrap();
        cache.set("b", 2, Some(Duration::from_millis(20))).unwrap();
        cache.set("c", 3, None).unwrap();
        cache.flush();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.cleanup_expired(), 2);
        assert_eq!(cache.get("c"), Some(3));
    }

    #[test]
    fn test_from_config_resolves_relative_dir() {
        let mut config = CacheConfig::default();
        config.persist = true;
        config.default_ttl_secs = Some(5);
        let options = CacheOptions::from_config(&config, Path::new("/var/lib/mnemo"));
        assert_eq!(options.disk_dir, Some(PathBuf::from("/var/lib/mnemo/cache")));
        assert_eq!(options.default_ttl, Some(Duration::from_secs(5)));

        config.persist = false;
        assert!(CacheOptions::from_config(&config, Path::new("/x")).disk_dir.is_none());
    }

    #[test]
    fn test_concurrent_get_set() {
        let cache = Arc::new(small_cache(50));
        let mut handles = vec![];
        for t in 0..4 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for i in 0..200 {
                    let key = format!("t{t}-{}", i % 20);
                    cache.set(key.clone(), format!("{i}"), None).unwrap();
                    cache.get(&key);
                    if i % 50 == 0 {
                        cache.cleanup_expired();
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert!(cache.len() <= 50);
    }

    #[test]
    fn test_concurrent_set_and_delete_keep_tiers_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let cache: Arc<TieredCache<u64>> = Arc::new(TieredCache::new(
            CacheOptions::memory_only(100, 1024 * 1024).with_disk(dir.path()),
        ));

        let mut resurrected = 0;
        for round in 0..500u64 {
            let barrier = Arc::new(std::sync::Barrier::new(2));
            let writer = {
                let (cache, barrier) = (Arc::clone(&cache), Arc::clone(&barrier));
                std::thread::spawn(move || {
                    barrier.wait();
                    cache.set("k", round, None).unwrap();
                })
            };
            let deleter = {
                let (cache, barrier) = (Arc::clone(&cache), Arc::clone(&barrier));
                std::thread::spawn(move || {
                    barrier.wait();
                    cache.delete("k");
                })
            };
            writer.join().unwrap();
            deleter.join().unwrap();
            assert!(cache.flush());

            let in_memory = cache.memory.lock().unwrap().peek("k", Utc::now());
            if !in_memory && cache.get("k").is_some() {
                resurrected += 1;
            }
            if in_memory {
                assert_eq!(cache.get("k"), Some(round));
            }
            cache.delete("k");
        }
        assert_eq!(resurrected, 0);
    }

    #[test]
    fn test_stale_disk_read_is_not_promoted() {
        let dir = tempfile::tempdir().unwrap();
        let cache: TieredCache<u64> =
            TieredCache::new(CacheOptions::memory_only(1, 1024).with_disk(dir.path()));
        cache.set("a", 1, None).unwrap();
        cache.set("b", 2, None).unwrap();
        assert!(cache.flush());

        // A write after the memory miss invalidates the disk read.
        let generation = cache.generation.load(Ordering::Acquire);
        cache.delete("b");
        assert_eq!(cache.read_disk("a", generation), Some(1));
        assert!(!cache.memory.lock().unwrap().peek("a", Utc::now()));

        let generation = cache.generation.load(Ordering::Acquire);
        assert_eq!(cache.read_disk("a", generation), Some(1));
        assert!(cache.memory.lock().unwrap().peek("a", Utc::now()));
    }
}
