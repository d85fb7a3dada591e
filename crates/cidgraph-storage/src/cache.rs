//! Fixed-capacity LRU cache shared between concurrent readers.
//!
//! All operations go through one mutex. Values are handed out as `Arc<V>`, so
//! evicting an entry never invalidates a value a caller already holds.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Arc;

#[derive(Debug)]
pub struct CacheEntry<V> {
    pub value: Arc<V>,
    /// Logical clock value of the last access.
    pub recency: u64,
    /// Number of accesses (insert counts as one).
    pub frequency: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub capacity: usize,
    pub len: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
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

pub struct LruCache<K, V> {
    inner: Mutex<LruInner<K, V>>,
}

struct LruInner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    /// Front = least recently used.
    lru: VecDeque<K>,
    capacity: usize,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl<K: Eq + Hash + Clone, V> LruInner<K, V> {
    fn touch(&mut self, key: &K) {
        if let Some(pos) = self.lru.iter().position(|k| k == key) {
            self.lru.remove(pos);
        }
        self.lru.push_back(key.clone());
    }
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruInner {
                entries: HashMap::new(),
                lru: VecDeque::new(),
                capacity: capacity.max(1),
                tick: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
            }),
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let value = match inner.entries.get_mut(key) {
            Some(entry) => {
                entry.recency = tick;
                entry.frequency += 1;
                Some(Arc::clone(&entry.value))
            }
            None => None,
        };
        if value.is_some() {
            inner.hits += 1;
            inner.touch(key);
        } else {
            inner.misses += 1;
        }
        value
    }

    /// Insert (or replace) `key`, evicting least-recently-used entries past
    /// capacity. Returns the shared handle to the stored value.
    pub fn insert(&self, key: K, value: V) -> Arc<V> {
        self.insert_arc(key, Arc::new(value))
    }

    pub fn insert_arc(&self, key: K, value: Arc<V>) -> Arc<V> {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let frequency = inner
            .entries
            .get(&key)
            .map_or(1, |existing| existing.frequency + 1);
        inner.entries.insert(
            key.clone(),
            CacheEntry {
                value: Arc::clone(&value),
                recency: tick,
                frequency,
            },
        );
        inner.touch(&key);

        while inner.lru.len() > inner.capacity {
            if let Some(oldest) = inner.lru.pop_front() {
                inner.entries.remove(&oldest);
                inner.evictions += 1;
                tracing::trace!(evictions = inner.evictions, "lru eviction");
            }
        }
        value
    }

    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        let mut inner = self.inner.lock();
        let removed = inner.entries.remove(key)?;
        if let Some(pos) = inner.lru.iter().position(|k| k == key) {
            inner.lru.remove(pos);
        }
        Some(removed.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.lru.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Access count of `key` without touching its recency.
    pub fn frequency(&self, key: &K) -> Option<u64> {
        self.inner.lock().entries.get(key).map(|e| e.frequency)
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            capacity: inner.capacity,
            len: inner.entries.len(),
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
        }
    }
}
