//! String-keyed cache with per-entry time-to-live

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::Result;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    timestamp: Instant,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    fn is_valid_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.timestamp) < self.ttl
    }
}

/// Thread-safe TTL cache. The lock is never held while a value is being fetched.
pub struct TtlCache<V> {
    name: &'static str,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(name: &'static str, ttl: Duration) -> Self {
        Self {
            name,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    pub fn get_at(&self, key: &str, now: Instant) -> Option<V> {
        let entries = self.entries.lock();
        entries
            .get(key)
            .filter(|entry| entry.is_valid_at(now))
            .map(|entry| entry.value.clone())
    }

    pub fn insert(&self, key: impl Into<String>, value: V) {
        self.insert_at(key, value, Instant::now());
    }

    pub fn insert_at(&self, key: impl Into<String>, value: V, now: Instant) {
        let mut entries = self.entries.lock();
        // Expired entries are only swept on insert
        entries.retain(|_, entry| entry.is_valid_at(now));
        entries.insert(
            key.into(),
            CacheEntry {
                value,
                timestamp: now,
                ttl: self.ttl,
            },
        );
    }

    pub fn get_or_fetch<F>(&self, key: &str, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        self.get_or_fetch_at(key, Instant::now(), fetch)
    }

    /// Returns the cached value, or runs `fetch` and stores its result.
    pub fn get_or_fetch_at<F>(&self, key: &str, now: Instant, fetch: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(value) = self.get_at(key, now) {
            tracing::trace!(cache = self.name, key, "cache hit");
            return Ok(value);
        }

        tracing::trace!(cache = self.name, key, "cache miss");
        let value = fetch()?;
        self.insert_at(key, value.clone(), now);
        Ok(value)
    }

    pub fn remove(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
