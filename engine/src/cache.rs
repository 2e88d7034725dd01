//! Process-local key-value cache with per-entry expiry.
//!
//! Entries are evicted lazily: an expired entry stays in the map until the
//! next read of its key removes it. There is no background sweep.
//!
//! A cache is an ordinary value. Construct one per logical resource and share
//! it by reference (or `Arc`) with every caller that needs it.

use crate::clock::{Clock, SystemClock};
use crate::Timestamp;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Serializes fills of one key in [`TtlCache::get_or_try_insert_with`].
type FillSlot = Arc<tokio::sync::Mutex<()>>;

/// TTL used for memoized search queries.
pub const SEARCH_TTL: Duration = Duration::from_secs(60);

/// Build the cache key for a product search.
pub fn search_key(
    query: &str,
    retailer: Option<&str>,
    category: Option<&str>,
    page: u32,
    limit: u32,
) -> String {
    format!(
        "search:{}:{}:{}:{}:{}",
        query,
        retailer.unwrap_or_default(),
        category.unwrap_or_default(),
        page,
        limit
    )
}

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expiry: Timestamp,
    last_access: Timestamp,
}

impl<V> CacheEntry<V> {
    fn is_live(&self, now: Timestamp) -> bool {
        now <= self.expiry
    }
}

/// Hit/miss counters and current size.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

#[derive(Debug)]
struct Inner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    hits: u64,
    misses: u64,
}

/// A TTL cache.
///
/// An entry is visible while `now <= expiry`. Reading an expired entry
/// deletes it and counts as a miss.
#[derive(Debug)]
pub struct TtlCache<V, C: Clock = SystemClock> {
    inner: Mutex<Inner<V>>,
    default_ttl: Duration,
    max_entries: Option<usize>,
    clock: C,
    in_flight: Mutex<HashMap<String, FillSlot>>,
}

impl<V: Clone> TtlCache<V, SystemClock> {
    /// Create a cache using the system clock.
    pub fn new(default_ttl: Duration) -> Self {
        Self::with_clock(default_ttl, SystemClock)
    }
}

impl<V: Clone, C: Clock> TtlCache<V, C> {
    /// Create a cache reading time from `clock`.
    pub fn with_clock(default_ttl: Duration, clock: C) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
            default_ttl,
            max_entries: None,
            clock,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Bound the number of entries. Inserting a new key into a full cache
    /// drops expired entries first, then the least recently accessed one.
    pub fn with_capacity(mut self, max_entries: usize) -> Self {
        self.max_entries = Some(max_entries.max(1));
        self
    }

    /// Store `value` under `key` for `ttl`.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let now = self.clock.now_millis();
        let expiry = now.saturating_add(ttl.as_millis() as u64);

        let mut inner = self.inner.lock();
        if let Some(max) = self.max_entries {
            if !inner.entries.contains_key(&key) && inner.entries.len() >= max {
                evict(&mut inner.entries, now);
            }
        }
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                expiry,
                last_access: now,
            },
        );
    }

    /// Store `value` under `key` for the default TTL.
    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.set(key, value, self.default_ttl);
    }

    /// Look up a live entry, purging it if it has expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();

        let state = inner.entries.get_mut(key).map(|entry| {
            if entry.is_live(now) {
                entry.last_access = now;
                Some(entry.value.clone())
            } else {
                None
            }
        });
        let live = match state {
            Some(Some(value)) => Some(value),
            Some(None) => {
                inner.entries.remove(key);
                None
            }
            None => None,
        };

        match live {
            Some(value) => {
                inner.hits += 1;
                Some(value)
            }
            None => {
                inner.misses += 1;
                None
            }
        }
    }

    /// A live value, without touching counters or access times.
    fn peek(&self, key: &str) -> Option<V> {
        let now = self.clock.now_millis();
        let inner = self.inner.lock();
        inner
            .entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    /// Whether a live entry exists. Does not touch hit/miss counters.
    pub fn contains(&self, key: &str) -> bool {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock();
        match inner.entries.get(key).map(|entry| entry.is_live(now)) {
            Some(true) => true,
            Some(false) => {
                inner.entries.remove(key);
                false
            }
            None => false,
        }
    }

    /// Remove an entry. Returns whether one was present.
    pub fn remove(&self, key: &str) -> bool {
        self.inner.lock().entries.remove(key).is_some()
    }

    /// Drop every entry and reset the counters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.hits = 0;
        inner.misses = 0;
    }

    /// Number of stored entries, including expired ones not yet read.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let lookups = inner.hits + inner.misses;
        CacheStats {
            entries: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                inner.hits as f64 / lookups as f64
            },
        }
    }

    /// Return the cached value for `key`, or compute, cache and return it.
    ///
    /// Only `Ok` values are cached. Concurrent misses on the same key share
    /// one call of `f`: later callers wait for it and read its value. If it
    /// fails, the next waiter runs its own `f`.
    pub async fn get_or_try_insert_with<F, Fut, E>(
        &self,
        key: &str,
        ttl: Duration,
        f: F,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(hit) = self.get(key) {
            return Ok(hit);
        }

        let slot = self.in_flight.lock().entry(key.to_string()).or_default().clone();
        let result = {
            let _turn = slot.lock().await;
            match self.peek(key) {
                Some(value) => Ok(value),
                None => f().await.map(|value| {
                    self.set(key, value.clone(), ttl);
                    value
                }),
            }
        };

        let mut in_flight = self.in_flight.lock();
        // Only the map and this caller still hold the slot
        if Arc::strong_count(&slot) == 2 {
            in_flight.remove(key);
        }
        result
    }
}

fn evict<V>(entries: &mut HashMap<String, CacheEntry<V>>, now: Timestamp) {
    let before = entries.len();
    entries.retain(|_, entry| entry.is_live(now));
    if entries.len() < before {
        return;
    }

    let oldest = entries
        .iter()
        .min_by_key(|(_, entry)| entry.last_access)
        .map(|(key, _)| key.clone());
    if let Some(key) = oldest {
        tracing::debug!(key = %key, "evicting least recently used cache entry");
        entries.remove(&key);
    }
}
