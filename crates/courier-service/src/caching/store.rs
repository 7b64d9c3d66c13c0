use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::clock::ClockRef;
use crate::config::CacheConfig;

/// The fraction of entries removed in one eviction pass.
const EVICTION_DIVISOR: usize = 5;

/// An item saved in the [`CacheStore`].
#[derive(Clone, Debug)]
struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    ttl: Duration,
    access_count: u64,
    last_accessed_at: Instant,
    /// Breaks ties between accesses that happened at the same [`Instant`].
    access_seq: u64,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl.is_zero() || now.saturating_duration_since(self.created_at) > self.ttl
    }
}

/// Counters describing the lifetime of a [`CacheStore`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
}

struct Inner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    next_seq: u64,
    stats: CacheStats,
}

impl<K, V> Inner<K, V> {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// A bounded in-memory cache with time-to-live expiry and least-recently-used eviction.
///
/// Expiry is checked lazily when an entry is read; expired entries are never swept proactively.
/// When a new key is inserted into a full store, the least recently accessed fifth of all entries
/// (but at least one) is evicted in a single pass before the insert.
pub struct CacheStore<K, V> {
    name: &'static str,
    max_size: usize,
    default_ttl: Duration,
    clock: ClockRef,
    inner: Mutex<Inner<K, V>>,
}

impl<K, V> fmt::Debug for CacheStore<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.inner.try_lock().map(|i| i.entries.len()).ok();
        f.debug_struct("CacheStore")
            .field("name", &self.name)
            .field("max_size", &self.max_size)
            .field("default_ttl", &self.default_ttl)
            .field("entries", &entries)
            .finish()
    }
}

impl<K, V> CacheStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a new store.
    ///
    /// `name` is used to tag metrics. A `max_size` of zero is treated as one.
    pub fn new(name: &'static str, config: &CacheConfig, clock: ClockRef) -> Self {
        Self {
            name,
            max_size: config.max_size.max(1),
            default_ttl: config.ttl,
            clock,
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                next_seq: 0,
                stats: CacheStats::default(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K, V>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Returns the value for `key` if it is present and fresh.
    ///
    /// A hit counts as an access for the purpose of LRU eviction.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let mut inner = self.lock();

        let expired = match inner.entries.get(key) {
            None => {
                inner.stats.misses += 1;
                metric!(counter("caches.memory.miss") += 1, "cache" => self.name);
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            inner.entries.remove(key);
            inner.stats.misses += 1;
            inner.stats.expirations += 1;
            metric!(counter("caches.memory.miss") += 1, "cache" => self.name);
            metric!(counter("caches.memory.expired") += 1, "cache" => self.name);
            return None;
        }

        let seq = inner.next_seq();
        inner.stats.hits += 1;
        let entry = inner.entries.get_mut(key)?;
        entry.access_count += 1;
        entry.last_accessed_at = now;
        entry.access_seq = seq;

        metric!(counter("caches.memory.hit") += 1, "cache" => self.name);
        Some(entry.value.clone())
    }

    /// Whether `key` holds a fresh value, without counting as an access.
    pub fn contains_key(&self, key: &K) -> bool {
        let now = self.clock.now();
        self.lock()
            .entries
            .get(key)
            .is_some_and(|entry| !entry.is_expired(now))
    }

    /// Inserts `value` with the default time-to-live.
    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.default_ttl)
    }

    /// Inserts `value`, replacing any previous value for `key`.
    ///
    /// A `ttl` of zero is valid and means the value is never served.
    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        let now = self.clock.now();
        let mut inner = self.lock();

        if !inner.entries.contains_key(&key) && inner.entries.len() >= self.max_size {
            self.evict(&mut inner);
        }

        let access_seq = inner.next_seq();
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                ttl,
                access_count: 0,
                last_accessed_at: now,
                access_seq,
            },
        );
    }

    /// Removes the least recently accessed fifth of all entries.
    fn evict(&self, inner: &mut Inner<K, V>) {
        let count = (inner.entries.len() / EVICTION_DIVISOR).max(1);

        let mut by_access: Vec<_> = inner
            .entries
            .iter()
            .map(|(key, entry)| ((entry.last_accessed_at, entry.access_seq), key.clone()))
            .collect();
        by_access.sort_unstable_by(|a, b| a.0.cmp(&b.0));

        for (_, key) in by_access.into_iter().take(count) {
            inner.entries.remove(&key);
        }

        inner.stats.evictions += count as u64;
        metric!(counter("caches.memory.evicted") += count as i64, "cache" => self.name);
        tracing::trace!(cache = self.name, count, "Evicted least recently used entries");
    }

    /// Removes `key`, returning whether it was present.
    pub fn delete(&self, key: &K) -> bool {
        self.lock().entries.remove(key).is_some()
    }

    /// Removes all entries.
    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    /// The number of entries, including expired ones that were not read yet.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// How often the value for `key` was read, if it is present.
    pub fn access_count(&self, key: &K) -> Option<u64> {
        self.lock().entries.get(key).map(|entry| entry.access_count)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.lock();
        CacheStats {
            entries: inner.entries.len(),
            ..inner.stats
        }
    }
}
