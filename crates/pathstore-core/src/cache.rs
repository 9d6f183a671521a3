//! Two-tier object cache.
//!
//! The fast tier is a bounded least-recently-used list holding strong
//! handles. Entries evicted from it drop into the overflow tier as weak
//! handles, which keep answering lookups only while something outside the
//! cache still owns the object. Deallocation is driven entirely by the
//! owners' reference counts; the overflow tier never keeps anything alive.
//!
//! The LRU list is an intrusive doubly linked list whose nodes live in a
//! `SlotMap` arena, so promotion and eviction are O(1) without unsafe code.
//! A single mutex guards both tiers, which makes every operation atomic: a
//! lookup racing an insertion for the same key resolves to one instance.

use parking_lot::Mutex;
use slotmap::{SlotMap, new_key_type};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Weak};

/// Overflow size below which dead weak entries are not swept eagerly.
const MIN_PURGE_THRESHOLD: usize = 64;

new_key_type! {
    /// Arena key of one fast-tier entry.
    struct EntryKey;
}

/// Hit/miss counters. Cheap to copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered by the fast tier.
    pub hits: u64,
    /// Lookups answered by the overflow tier (and promoted).
    pub overflow_hits: u64,
    pub misses: u64,
    /// Entries moved from the fast tier to the overflow tier.
    pub evictions: u64,
}

impl CacheStats {
    pub fn lookups(&self) -> u64 {
        self.hits + self.overflow_hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        match self.lookups() {
            0 => 0.0,
            n => (self.hits + self.overflow_hits) as f64 / n as f64,
        }
    }
}

struct LruEntry<K, V: ?Sized> {
    key: K,
    value: Arc<V>,
    /// Towards the most recently used end.
    prev: Option<EntryKey>,
    /// Towards the least recently used end.
    next: Option<EntryKey>,
}

struct Tiers<K, V: ?Sized> {
    limit: usize,
    entries: SlotMap<EntryKey, LruEntry<K, V>>,
    index: HashMap<K, EntryKey>,
    head: Option<EntryKey>,
    tail: Option<EntryKey>,
    overflow: HashMap<K, Weak<V>>,
    purge_threshold: usize,
    stats: CacheStats,
}

impl<K: Eq + Hash + Clone, V: ?Sized> Tiers<K, V> {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            entries: SlotMap::with_key(),
            index: HashMap::new(),
            head: None,
            tail: None,
            overflow: HashMap::new(),
            purge_threshold: MIN_PURGE_THRESHOLD,
            stats: CacheStats::default(),
        }
    }

    fn unlink(&mut self, key: EntryKey) {
        let (prev, next) = {
            let entry = &self.entries[key];
            (entry.prev, entry.next)
        };
        match prev {
            Some(p) => self.entries[p].next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.entries[n].prev = prev,
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, key: EntryKey) {
        let old_head = self.head;
        {
            let entry = &mut self.entries[key];
            entry.prev = None;
            entry.next = old_head;
        }
        match old_head {
            Some(h) => self.entries[h].prev = Some(key),
            None => self.tail = Some(key),
        }
        self.head = Some(key);
    }

    fn touch(&mut self, key: EntryKey) {
        if self.head != Some(key) {
            self.unlink(key);
            self.push_front(key);
        }
    }

    /// Insert or replace `key` at the most recently used position.
    fn insert_front(&mut self, key: K, value: Arc<V>) {
        self.overflow.remove(&key);
        match self.index.get(&key).copied() {
            Some(entry_key) => {
                self.entries[entry_key].value = value;
                self.touch(entry_key);
            }
            None => {
                let entry_key = self.entries.insert(LruEntry {
                    key: key.clone(),
                    value,
                    prev: None,
                    next: None,
                });
                self.index.insert(key, entry_key);
                self.push_front(entry_key);
            }
        }
        self.enforce_limit();
    }

    fn lookup_fast(&mut self, key: &K) -> Option<Arc<V>> {
        let entry_key = self.index.get(key).copied()?;
        self.touch(entry_key);
        Some(Arc::clone(&self.entries[entry_key].value))
    }

    /// Upgrade an overflow entry, dropping it if its object is gone.
    fn lookup_overflow(&mut self, key: &K) -> Option<Arc<V>> {
        let upgraded = self.overflow.get(key).map(Weak::upgrade)?;
        if upgraded.is_none() {
            self.overflow.remove(key);
        }
        upgraded
    }

    fn enforce_limit(&mut self) {
        while self.index.len() > self.limit {
            let Some(lru) = self.tail else { break };
            self.unlink(lru);
            if let Some(entry) = self.entries.remove(lru) {
                self.index.remove(&entry.key);
                self.overflow.insert(entry.key, Arc::downgrade(&entry.value));
                self.stats.evictions += 1;
            }
        }
        if self.overflow.len() > self.purge_threshold {
            self.purge();
            self.purge_threshold = (self.overflow.len() * 2).max(MIN_PURGE_THRESHOLD);
        }
    }

    fn purge(&mut self) {
        self.overflow.retain(|_, weak| weak.strong_count() > 0);
    }

    fn remove_fast(&mut self, key: &K) -> Option<Arc<V>> {
        let entry_key = self.index.remove(key)?;
        self.unlink(entry_key);
        self.entries.remove(entry_key).map(|e| e.value)
    }
}

/// Bounded most-recently-used cache backed by a weak overflow tier.
pub struct TieredCache<K, V: ?Sized> {
    tiers: Mutex<Tiers<K, V>>,
}

impl<K, V: ?Sized> fmt::Debug for TieredCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tiers = self.tiers.lock();
        f.debug_struct("TieredCache")
            .field("limit", &tiers.limit)
            .field("fast", &tiers.index.len())
            .field("overflow", &tiers.overflow.len())
            .field("stats", &tiers.stats)
            .finish()
    }
}

impl<K: Eq + Hash + Clone, V: ?Sized> TieredCache<K, V> {
    /// Create a cache whose fast tier holds at most `limit` entries.
    pub fn new(limit: usize) -> Self {
        Self {
            tiers: Mutex::new(Tiers::new(limit)),
        }
    }

    /// Look up `key`. A fast-tier hit becomes most recently used; an
    /// overflow hit is promoted back into the fast tier.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let mut guard = self.tiers.lock();
        let tiers = &mut *guard;
        if let Some(value) = tiers.lookup_fast(key) {
            tiers.stats.hits += 1;
            return Some(value);
        }
        match tiers.lookup_overflow(key) {
            Some(value) => {
                tiers.stats.overflow_hits += 1;
                tiers.insert_front(key.clone(), Arc::clone(&value));
                Some(value)
            }
            None => {
                tiers.stats.misses += 1;
                None
            }
        }
    }

    /// Insert into the fast tier, replacing any previous entry for `key`.
    pub fn put(&self, key: K, value: Arc<V>) {
        self.tiers.lock().insert_front(key, value);
    }

    /// Insert `value` unless a live instance for `key` already exists, in
    /// which case that instance is promoted and returned instead. The
    /// returned handle is the single winner for `key`.
    pub fn insert_if_absent(&self, key: K, value: Arc<V>) -> Arc<V> {
        let mut guard = self.tiers.lock();
        let tiers = &mut *guard;
        if let Some(existing) = tiers.lookup_fast(&key) {
            return existing;
        }
        let winner = tiers.lookup_overflow(&key).unwrap_or(value);
        tiers.insert_front(key, Arc::clone(&winner));
        winner
    }

    /// Whether a live instance for `key` is cached. Does not promote.
    pub fn contains(&self, key: &K) -> bool {
        let tiers = self.tiers.lock();
        tiers.index.contains_key(key)
            || tiers
                .overflow
                .get(key)
                .is_some_and(|weak| weak.strong_count() > 0)
    }

    /// Remove `key` from both tiers, returning the live instance if any.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        let mut guard = self.tiers.lock();
        let tiers = &mut *guard;
        let fast = tiers.remove_fast(key);
        let overflow = tiers.overflow.remove(key).and_then(|weak| weak.upgrade());
        fast.or(overflow)
    }

    /// Change the fast-tier limit. Shrinking evicts least recently used
    /// entries to the overflow tier; growing leaves contents untouched.
    pub fn resize(&self, limit: usize) {
        let mut tiers = self.tiers.lock();
        tiers.limit = limit;
        tiers.enforce_limit();
    }

    pub fn limit(&self) -> usize {
        self.tiers.lock().limit
    }

    pub fn fast_len(&self) -> usize {
        self.tiers.lock().index.len()
    }

    /// Number of overflow entries whose objects are still alive.
    pub fn overflow_len(&self) -> usize {
        self.tiers
            .lock()
            .overflow
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Fast-tier keys, most recently used first.
    pub fn keys_by_recency(&self) -> Vec<K> {
        let tiers = self.tiers.lock();
        let mut keys = Vec::with_capacity(tiers.index.len());
        let mut cursor = tiers.head;
        while let Some(entry_key) = cursor {
            let entry = &tiers.entries[entry_key];
            keys.push(entry.key.clone());
            cursor = entry.next;
        }
        keys
    }

    /// Drop overflow entries whose objects have been deallocated.
    pub fn purge(&self) {
        self.tiers.lock().purge();
    }

    pub fn clear(&self) {
        let mut tiers = self.tiers.lock();
        let limit = tiers.limit;
        let stats = tiers.stats;
        *tiers = Tiers::new(limit);
        tiers.stats = stats;
    }

    pub fn stats(&self) -> CacheStats {
        self.tiers.lock().stats
    }
}
