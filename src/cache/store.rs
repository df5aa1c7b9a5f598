use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use super::CacheConfig;
use crate::stats::{StatsEvent, StatsRegistry, hit_rate_percent};

/// Far-future expiry used when `now + ttl` overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Recency key: last access time, then creation time, then insertion order.
type LruKey = (Instant, Instant, u64);

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    expires_at: Instant,
    last_accessed_at: Instant,
    insert_seq: u64,
    access_count: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn lru_key(&self) -> LruKey {
        (self.last_accessed_at, self.created_at, self.insert_seq)
    }
}

/// State guarded by the store's single mutex.
///
/// `lru` mirrors `entries` exactly: one recency key per entry.
#[derive(Debug)]
struct Inner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    lru: BTreeMap<LruKey, String>,
    next_seq: u64,
}

impl<V> Inner<V> {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            lru: BTreeMap::new(),
            next_seq: 0,
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn insert(&mut self, key: String, value: V, now: Instant, ttl: Duration) {
        let seq = self.next_seq();
        let expires_at = now
            .checked_add(ttl)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(now);
        self.lru.insert((now, now, seq), key.clone());
        self.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                expires_at,
                last_accessed_at: now,
                insert_seq: seq,
                access_count: 0,
            },
        );
    }

    /// Mark an entry as used and return it.
    fn touch(&mut self, key: &str, now: Instant) -> Option<&CacheEntry<V>> {
        let entry = self.entries.get_mut(key)?;
        self.lru.remove(&entry.lru_key());
        entry.last_accessed_at = now;
        entry.access_count += 1;
        self.lru.insert(entry.lru_key(), key.to_owned());
        Some(entry)
    }

    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        self.lru.remove(&entry.lru_key());
        Some(entry)
    }

    fn evict_lru(&mut self) -> Option<String> {
        let (_, key) = self.lru.pop_first()?;
        self.entries.remove(&key);
        Some(key)
    }

    fn purge_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.remove(key);
        }
        expired.len()
    }
}

/// Point-in-time counters for one [`CacheStore`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub max_entries: usize,
    pub evictions: u64,
    pub expirations: u64,
    pub hit_rate_percent: f64,
}

/// Introspection view of a single live entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub key: String,
    pub age: Duration,
    pub ttl_remaining: Duration,
    pub access_count: u64,
    pub stale: bool,
}

/// Thread-safe LRU + TTL cache.
///
/// All operations take one `parking_lot::Mutex` for the duration of an
/// in-memory update and are linearizable with respect to each other. The
/// lock is never held across an `.await`.
pub struct CacheStore<V> {
    inner: Mutex<Inner<V>>,
    config: CacheConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    stats: Option<Arc<StatsRegistry>>,
}

impl<V: Clone> CacheStore<V> {
    /// Create an empty store. A `max_entries` of 0 is treated as 1.
    pub fn new(config: CacheConfig) -> Self {
        let config = CacheConfig {
            max_entries: config.max_entries.max(1),
            ..config
        };
        Self {
            inner: Mutex::new(Inner::new()),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
            stats: None,
        }
    }

    /// Forward hit/miss/eviction events to a shared registry.
    pub fn with_stats(mut self, stats: Arc<StatsRegistry>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a live entry.
    ///
    /// Returns `None` when the key is absent or its TTL has elapsed; an
    /// expired entry is removed on the spot. A hit refreshes the entry's
    /// last-access time.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let Some(expired) = inner.entries.get(key).map(|entry| entry.is_expired(now)) else {
            drop(inner);
            self.record_miss(key);
            return None;
        };

        if expired {
            inner.remove(key);
            let size = inner.entries.len();
            drop(inner);
            debug!(key, "cache entry expired");
            self.expirations.fetch_add(1, Ordering::Relaxed);
            self.emit(StatsEvent::CacheExpired);
            self.emit(StatsEvent::CacheSize(size));
            self.record_miss(key);
            return None;
        }

        let stale_after = self.config.stale_after_duration();
        let (value, age) = match inner.touch(key, now) {
            Some(entry) => (entry.value.clone(), now - entry.created_at),
            None => return None,
        };
        drop(inner);

        if stale_after.is_some_and(|threshold| age >= threshold) {
            debug!(key, age_secs = age.as_secs(), "serving stale cache entry");
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.emit(StatsEvent::CacheHit);
        Some(value)
    }

    /// Insert or overwrite an entry.
    ///
    /// A new key arriving at a full store first drops expired entries, then
    /// evicts least-recently-used entries until there is room. Overwriting
    /// an existing key never evicts.
    pub fn put(&self, key: impl Into<String>, value: V) {
        let key = key.into();
        let now = Instant::now();
        let mut evicted = Vec::new();
        let mut expired = 0;

        let mut inner = self.inner.lock();
        if inner.remove(&key).is_none() && inner.entries.len() >= self.config.max_entries {
            expired = inner.purge_expired(now);
            while inner.entries.len() >= self.config.max_entries {
                match inner.evict_lru() {
                    Some(victim) => evicted.push(victim),
                    None => break,
                }
            }
        }
        inner.insert(key, value, now, self.config.ttl_duration());
        let size = inner.entries.len();
        drop(inner);

        if expired > 0 {
            self.expirations.fetch_add(expired as u64, Ordering::Relaxed);
            for _ in 0..expired {
                self.emit(StatsEvent::CacheExpired);
            }
        }
        for victim in &evicted {
            debug!(key = %victim, "cache LRU eviction");
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.emit(StatsEvent::CacheEviction);
        }
        self.emit(StatsEvent::CacheSize(size));
    }

    /// Return the cached value, or run `fetch` and cache its result.
    ///
    /// The lock is released while `fetch` runs, so concurrent callers for
    /// the same key may both fetch; the last write wins. Errors are returned
    /// as-is and nothing is cached.
    pub async fn get_or_insert_with<F, Fut, E>(
        &self,
        key: &str,
        fetch: F,
    ) -> std::result::Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = fetch().await?;
        self.put(key, value.clone());
        Ok(value)
    }

    /// Remove an entry. Returns whether it was present (expired or not).
    pub fn invalidate(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let removed = inner.remove(key).is_some();
        let size = inner.entries.len();
        drop(inner);
        if removed {
            debug!(key, "cache entry invalidated");
            self.emit(StatsEvent::CacheSize(size));
        }
        removed
    }

    /// Drop every entry. Counters are kept.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let count = inner.entries.len();
        inner.entries.clear();
        inner.lru.clear();
        drop(inner);
        debug!(count, "cache cleared");
        self.emit(StatsEvent::CacheSize(0));
    }

    /// Physically remove expired entries. Returns how many were dropped.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let removed = inner.purge_expired(now);
        let size = inner.entries.len();
        drop(inner);
        if removed > 0 {
            debug!(removed, "swept expired cache entries");
            self.expirations.fetch_add(removed as u64, Ordering::Relaxed);
            for _ in 0..removed {
                self.emit(StatsEvent::CacheExpired);
            }
            self.emit(StatsEvent::CacheSize(size));
        }
        removed
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        CacheStats {
            hits,
            misses,
            size: self.len(),
            max_entries: self.config.max_entries,
            evictions: self.evictions.load(Ordering::Relaxed),
            expirations: self.expirations.load(Ordering::Relaxed),
            hit_rate_percent: hit_rate_percent(hits, misses),
        }
    }

    /// Describe every live entry, sorted by key. Does not count as access.
    pub fn entries(&self) -> Vec<EntryInfo> {
        let now = Instant::now();
        let stale_after = self.config.stale_after_duration();
        let inner = self.inner.lock();
        let mut infos: Vec<EntryInfo> = inner
            .entries
            .iter()
            .filter(|(_, entry)| !entry.is_expired(now))
            .map(|(key, entry)| {
                let age = now - entry.created_at;
                EntryInfo {
                    key: key.clone(),
                    age,
                    ttl_remaining: entry.expires_at - now,
                    access_count: entry.access_count,
                    stale: stale_after.is_some_and(|threshold| age >= threshold),
                }
            })
            .collect();
        drop(inner);
        infos.sort_by(|a, b| a.key.cmp(&b.key));
        infos
    }

    fn record_miss(&self, key: &str) {
        debug!(key, "cache miss");
        self.misses.fetch_add(1, Ordering::Relaxed);
        self.emit(StatsEvent::CacheMiss);
    }

    fn emit(&self, event: StatsEvent<'_>) {
        if let Some(stats) = &self.stats {
            stats.record(event);
        }
    }
}
