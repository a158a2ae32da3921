//! Bounded, hash-keyed store of pre-built chunk sets with LRU eviction, plus the
//! single-flight guard that keeps concurrent misses from fetching the same key twice.
//!
//! Shared by every connected device (content is device-agnostic); safe to use from
//! several threads through `&self`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::chunk::ChunkSet;

/// Default entry bound for artwork.
pub const DEFAULT_ARTWORK_ENTRIES: usize = 16;
/// Default entry bound for lyrics.
pub const DEFAULT_LYRICS_ENTRIES: usize = 32;

/// Kind of cached content. Each class has its own cache instance and bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ContentClass {
    Artwork,
    Lyrics,
}

impl fmt::Display for ContentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContentClass::Artwork => f.write_str("artwork"),
            ContentClass::Lyrics => f.write_str("lyrics"),
        }
    }
}

struct CacheEntry {
    chunks: Arc<ChunkSet>,
    last_access: u64,
}

#[derive(Default)]
struct Entries {
    map: HashMap<String, CacheEntry>,
    clock: u64,
}

impl Entries {
    fn touch(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

pub struct ChunkCache {
    class: ContentClass,
    capacity: usize,
    entries: Mutex<Entries>,
    in_flight: Mutex<HashSet<String>>,
}

impl ChunkCache {
    /// A capacity of 0 is treated as 1.
    pub fn new(class: ContentClass, capacity: usize) -> Self {
        Self {
            class,
            capacity: capacity.max(1),
            entries: Mutex::new(Entries::default()),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn class(&self) -> ContentClass {
        self.class
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up a key and mark it most recently used.
    pub fn get(&self, key: &str) -> Option<Arc<ChunkSet>> {
        let mut e = self.entries.lock();
        let now = e.touch();
        let entry = e.map.get_mut(key)?;
        entry.last_access = now;
        Some(Arc::clone(&entry.chunks))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().map.contains_key(key)
    }

    /// Insert or replace, evicting least recently used entries beyond capacity.
    pub fn put(&self, key: impl Into<String>, chunks: Arc<ChunkSet>) {
        let key = key.into();
        let mut e = self.entries.lock();
        let now = e.touch();
        e.map.insert(
            key,
            CacheEntry {
                chunks,
                last_access: now,
            },
        );
        while e.map.len() > self.capacity {
            let oldest = e
                .map
                .iter()
                .min_by_key(|(_, v)| v.last_access)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    e.map.remove(&k);
                    tracing::debug!(class = %self.class, key = %k, "evicted cache entry");
                }
                None => break,
            }
        }
    }

    pub fn remove(&self, key: &str) -> Option<Arc<ChunkSet>> {
        self.entries.lock().map.remove(key).map(|e| e.chunks)
    }

    pub fn clear(&self) {
        self.entries.lock().map.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Atomically claim the upstream fetch for `key`. False if a fetch is already running.
    pub fn try_begin_fetch(&self, key: &str) -> bool {
        self.in_flight.lock().insert(key.to_string())
    }

    /// Release the claim taken by [`try_begin_fetch`](Self::try_begin_fetch).
    pub fn end_fetch(&self, key: &str) {
        self.in_flight.lock().remove(key);
    }

    pub fn is_fetching(&self, key: &str) -> bool {
        self.in_flight.lock().contains(key)
    }
}

impl fmt::Debug for ChunkCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkCache")
            .field("class", &self.class)
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn set(byte: u8) -> Arc<ChunkSet> {
        Arc::new(ChunkSet::encode(byte as u32, &[byte; 10], 496).unwrap())
    }

    #[test]
    fn get_put_remove_clear() {
        let cache = ChunkCache::new(ContentClass::Artwork, 4);
        assert!(cache.get("a").is_none());
        cache.put("a", set(1));
        assert_eq!(cache.get("a").unwrap().content_hash, 1);
        assert!(cache.remove("a").is_some());
        assert!(cache.get("a").is_none());
        cache.put("b", set(2));
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = ChunkCache::new(ContentClass::Lyrics, 2);
        cache.put("a", set(1));
        cache.put("b", set(2));
        // Touch "a" so "b" becomes the oldest.
        cache.get("a");
        cache.put("c", set(3));
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn replacing_key_does_not_evict() {
        let cache = ChunkCache::new(ContentClass::Artwork, 2);
        cache.put("a", set(1));
        cache.put("b", set(2));
        cache.put("a", set(9));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").unwrap().content_hash, 9);
    }

    #[test]
    fn eviction_keeps_outstanding_references_alive() {
        let cache = ChunkCache::new(ContentClass::Artwork, 1);
        cache.put("a", set(1));
        let held = cache.get("a").unwrap();
        cache.put("b", set(2));
        assert!(!cache.contains("a"));
        assert_eq!(held.payload(), vec![1u8; 10]);
    }

    #[test]
    fn single_flight_claim_and_release() {
        let cache = ChunkCache::new(ContentClass::Artwork, 4);
        assert!(cache.try_begin_fetch("X"));
        assert!(!cache.try_begin_fetch("X"));
        assert!(cache.try_begin_fetch("Y"));
        cache.end_fetch("X");
        assert!(cache.try_begin_fetch("X"));
    }

    #[test]
    fn single_flight_concurrent_only_one_wins() {
        let cache = Arc::new(ChunkCache::new(ContentClass::Artwork, 4));
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    cache.try_begin_fetch("X")
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
