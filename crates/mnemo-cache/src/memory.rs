//! Memory tier: `lru::LruCache` ordering with lazy TTL expiry and a byte
//! budget layered on top.

use std::num::NonZeroUsize;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;

/// One cached value plus its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub created_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub ttl: Option<Duration>,
    /// Estimated size, fixed at insertion time.
    pub size_bytes: usize,
}

impl<V> CacheEntry<V> {
    pub fn new(key: impl Into<String>, value: V, ttl: Option<Duration>, size_bytes: usize) -> Self {
        let now = Utc::now();
        Self {
            key: key.into(),
            value,
            created_at: now,
            last_accessed_at: now,
            access_count: 0,
            ttl,
            size_bytes,
        }
    }

    /// True strictly after `created_at + ttl`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        is_expired(self.created_at, self.ttl, now)
    }
}

/// Shared by both tiers so they agree on when an entry dies.
pub(crate) fn is_expired(created_at: DateTime<Utc>, ttl: Option<Duration>, now: DateTime<Utc>) -> bool {
    match ttl {
        None => false,
        // A negative age (clock moved backwards) counts as fresh.
        Some(ttl) => now
            .signed_duration_since(created_at)
            .to_std()
            .map(|age| age > ttl)
            .unwrap_or(false),
    }
}

/// Outcome of a memory-tier lookup.
#[derive(Debug)]
pub(crate) enum Lookup<V> {
    Hit(V),
    /// The entry was present but past its TTL and has been removed.
    Expired,
    Miss,
}

#[derive(Debug)]
pub(crate) struct MemoryTier<V> {
    entries: LruCache<String, CacheEntry<V>>,
    bytes: usize,
    max_bytes: usize,
}

impl<V: Clone> MemoryTier<V> {
    pub(crate) fn new(max_entries: usize, max_bytes: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            bytes: 0,
            max_bytes,
        }
    }

    /// Look up `key`, refreshing its recency on a hit.
    pub(crate) fn get(&mut self, key: &str, now: DateTime<Utc>) -> Lookup<V> {
        let expired = match self.entries.peek(key) {
            None => return Lookup::Miss,
            Some(entry) => entry.is_expired(now),
        };
        if expired {
            self.remove(key);
            return Lookup::Expired;
        }

        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.last_accessed_at = now;
                entry.access_count += 1;
                Lookup::Hit(entry.value.clone())
            }
            None => Lookup::Miss,
        }
    }

    /// Non-expired presence check that leaves recency untouched.
    pub(crate) fn peek(&self, key: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .peek(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Insert or replace, then evict LRU entries until both budgets hold.
    /// Returns the evicted keys.
    ///
    /// The caller guarantees `entry.size_bytes <= max_bytes`, so the new
    /// entry itself is never a victim.
    pub(crate) fn insert(&mut self, entry: CacheEntry<V>) -> Vec<String> {
        let key = entry.key.clone();
        self.remove(&key);

        let mut evicted = Vec::new();
        self.bytes += entry.size_bytes;
        // With the key gone, anything `push` hands back is a capacity victim.
        if let Some((victim, old)) = self.entries.push(key, entry) {
            self.bytes = self.bytes.saturating_sub(old.size_bytes);
            evicted.push(victim);
        }

        while self.bytes > self.max_bytes && self.entries.len() > 1 {
            let Some((victim, old)) = self.entries.pop_lru() else {
                break;
            };
            self.bytes = self.bytes.saturating_sub(old.size_bytes);
            evicted.push(victim);
        }
        evicted
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.pop(key)?;
        self.bytes = self.bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.bytes = 0;
    }

    /// Remove every expired entry. Returns the removed keys.
    pub(crate) fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    pub(crate) fn max_entries(&self) -> usize {
        self.entries.cap().get()
    }

    pub(crate) fn max_bytes(&self) -> usize {
        self.max_bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: &str, size: usize) -> CacheEntry<u32> {
        CacheEntry::new(key, 0, None, size)
    }

    #[test]
    fn test_lru_order_follows_access() {
        let mut tier = MemoryTier::new(3, usize::MAX);
        for key in ["a", "b", "c"] {
            assert!(tier.insert(entry(key, 1)).is_empty());
        }
        assert!(matches!(tier.get("a", Utc::now()), Lookup::Hit(_)));
        let evicted = tier.insert(entry("d", 1));
        assert_eq!(evicted, vec!["b".to_string()]);
        assert_eq!(tier.len(), 3);
    }

    #[test]
    fn test_byte_budget_evicts_until_it_fits() {
        let mut tier = MemoryTier::new(100, 10);
        tier.insert(entry("a", 4));
        tier.insert(entry("b", 4));
        let evicted = tier.insert(entry("c", 8));
        assert_eq!(evicted, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(tier.bytes(), 8);
    }

    #[test]
    fn test_replace_adjusts_bytes() {
        let mut tier = MemoryTier::new(10, 100);
        tier.insert(entry("a", 40));
        tier.insert(entry("a", 10));
        assert_eq!(tier.len(), 1);
        assert_eq!(tier.bytes(), 10);
    }

    #[test]
    fn test_replace_at_capacity_evicts_nothing() {
        let mut tier = MemoryTier::new(2, usize::MAX);
        tier.insert(entry("a", 1));
        tier.insert(entry("b", 1));
        assert!(tier.insert(entry("a", 3)).is_empty());
        assert_eq!(tier.len(), 2);
        assert_eq!(tier.bytes(), 4);
        assert_eq!(tier.max_entries(), 2);

        // "b" is now least recent.
        assert_eq!(tier.insert(entry("c", 1)), vec!["b".to_string()]);
    }

    #[test]
    fn test_expired_lookup_removes() {
        let mut tier = MemoryTier::new(10, 100);
        let mut e = CacheEntry::new("a", 1u32, Some(Duration::from_secs(1)), 1);
        e.created_at = Utc::now() - chrono::Duration::seconds(5);
        tier.insert(e);
        assert!(!tier.peek("a", Utc::now()));
        assert!(matches!(tier.get("a", Utc::now()), Lookup::Expired));
        assert_eq!(tier.len(), 0);
        assert_eq!(tier.bytes(), 0);
    }

    #[test]
    fn test_purge_expired() {
        let mut tier = MemoryTier::new(10, 100);
        let mut old = CacheEntry::new("old", 1u32, Some(Duration::from_millis(10)), 1);
        old.created_at = Utc::now() - chrono::Duration::seconds(1);
        tier.insert(old);
        tier.insert(CacheEntry::new("fresh", 2u32, Some(Duration::from_secs(60)), 1));
        tier.insert(CacheEntry::new("forever", 3u32, None, 1));
        assert_eq!(tier.purge_expired(Utc::now()), vec!["old".to_string()]);
        assert_eq!(tier.len(), 2);
    }

    #[test]
    fn test_is_expired_is_strict() {
        let created = Utc::now();
        let ttl = Some(Duration::from_secs(10));
        assert!(!is_expired(created, ttl, created + chrono::Duration::seconds(10)));
        assert!(is_expired(created, ttl, created + chrono::Duration::milliseconds(10_001)));
        assert!(!is_expired(created, None, created + chrono::Duration::days(365)));
    }
}
