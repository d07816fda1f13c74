//! # LRU+TTL Shard
//!
//! One bounded partition of the key space: a hash map over an arena of
//! recency-list nodes. The list is expressed with `prev`/`next` indices into
//! the arena, so there are no shared-ownership pointers and freed slots are
//! recycled through a free list.
//!
//! Promotion is lazy: a hit inside a 1-second window since the last
//! promotion skips the list splice entirely, which keeps the hot read path
//! on the shared lock. Eviction order may therefore deviate from strict LRU
//! by up to one second of activity.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::{RwLock, RwLockWriteGuard};
use rand::Rng;

use kura_core::codec::CacheKey;
use kura_core::stats::CacheStats;
use kura_core::time::{now_ms, now_unix_ms};

const NIL: usize = usize::MAX;

/// Window during which repeat hits skip list promotion.
const PROMOTE_WINDOW_MS: u64 = 1000;

struct Node<K> {
    key: K,
    value: Bytes,
    /// Absolute expiry in unix millis; 0 means never expires.
    expiry_ms: i64,
    prev: usize,
    next: usize,
}

struct ShardInner<K> {
    nodes: Vec<Node<K>>,
    free: Vec<usize>,
    map: HashMap<K, usize>,
    head: usize,
    tail: usize,
}

impl<K: CacheKey> ShardInner<K> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            nodes: Vec::with_capacity(capacity.min(4096)),
            free: Vec::new(),
            map: HashMap::with_capacity(capacity.min(4096)),
            head: NIL,
            tail: NIL,
        }
    }

    fn alloc(&mut self, key: K, value: Bytes, expiry_ms: i64) -> usize {
        let node = Node {
            key,
            value,
            expiry_ms,
            prev: NIL,
            next: NIL,
        };
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = node;
            idx
        } else {
            self.nodes.push(node);
            self.nodes.len() - 1
        }
    }

    fn detach(&mut self, idx: usize) {
        let (prev, next) = (self.nodes[idx].prev, self.nodes[idx].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else {
            self.tail = prev;
        }
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = NIL;
    }

    fn push_front(&mut self, idx: usize) {
        self.nodes[idx].prev = NIL;
        self.nodes[idx].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = idx;
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn move_to_front(&mut self, idx: usize) {
        if self.head == idx {
            return;
        }
        self.detach(idx);
        self.push_front(idx);
    }

    /// Unlink a node, drop its map entry, and recycle the slot.
    fn erase(&mut self, idx: usize) {
        self.detach(idx);
        let key = self.nodes[idx].key.clone();
        self.map.remove(&key);
        self.nodes[idx].value = Bytes::new();
        self.free.push(idx);
    }
}

fn is_expired(expiry_ms: i64, now: i64) -> bool {
    expiry_ms != 0 && expiry_ms < now
}

/// One shard of the sharded store: bounded LRU with per-entry TTL, stats
/// counters, and the try-lock sweep primitives used by the expiration
/// driver.
pub struct CacheShard<K: CacheKey> {
    inner: RwLock<ShardInner<K>>,
    capacity: usize,

    // Stats counters live beside the lock and are updated with relaxed
    // ordering; they need not be strictly consistent with the map state.
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    evictions: AtomicU64,
    puts: AtomicU64,
    removes: AtomicU64,
    peak_size: AtomicUsize,
    start_time_ms: AtomicU64,
    last_access_time_ms: AtomicU64,
    last_hit_time_ms: AtomicU64,
    last_miss_time_ms: AtomicU64,

    /// Unix millis of the last list promotion (lazy-LRU window).
    last_promote_ms: AtomicU64,
}

impl<K: CacheKey> CacheShard<K> {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(ShardInner::with_capacity(capacity)),
            capacity,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            puts: AtomicU64::new(0),
            removes: AtomicU64::new(0),
            peak_size: AtomicUsize::new(0),
            start_time_ms: AtomicU64::new(now_unix_ms()),
            last_access_time_ms: AtomicU64::new(0),
            last_hit_time_ms: AtomicU64::new(0),
            last_miss_time_ms: AtomicU64::new(0),
            last_promote_ms: AtomicU64::new(0),
        }
    }

    /// Look up a key. An expired entry found here is removed in place and
    /// reported as a miss.
    pub fn get(&self, key: &K) -> Option<Bytes> {
        let now = now_ms();
        let now_u = now as u64;
        self.last_access_time_ms.store(now_u, Ordering::Relaxed);

        // Fast path: shared lock only.
        {
            let inner = self.inner.read();
            match inner.map.get(key) {
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    self.last_miss_time_ms.store(now_u, Ordering::Relaxed);
                    return None;
                }
                Some(&idx) => {
                    let node = &inner.nodes[idx];
                    if !is_expired(node.expiry_ms, now) {
                        let last = self.last_promote_ms.load(Ordering::Relaxed);
                        // Clock regression makes now < last; treat that as
                        // "recently promoted" rather than underflowing.
                        if now_u < last || now_u - last <= PROMOTE_WINDOW_MS {
                            self.hits.fetch_add(1, Ordering::Relaxed);
                            self.last_hit_time_ms.store(now_u, Ordering::Relaxed);
                            return Some(node.value.clone());
                        }
                    }
                }
            }
        }

        // Slow path: the entry is expired or due for promotion.
        let mut inner = self.inner.write();
        let idx = match inner.map.get(key) {
            // Deleted between the locks.
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                self.last_miss_time_ms.store(now_u, Ordering::Relaxed);
                return None;
            }
            Some(&idx) => idx,
        };

        if is_expired(inner.nodes[idx].expiry_ms, now) {
            inner.erase(idx);
            self.expired.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.last_miss_time_ms.store(now_u, Ordering::Relaxed);
            return None;
        }

        let last = self.last_promote_ms.load(Ordering::Relaxed);
        if now_u >= last && now_u - last > PROMOTE_WINDOW_MS {
            inner.move_to_front(idx);
            self.last_promote_ms.store(now_u, Ordering::Relaxed);
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        self.last_hit_time_ms.store(now_u, Ordering::Relaxed);
        Some(inner.nodes[idx].value.clone())
    }

    /// Insert or update. `ttl_ms == 0` means never expires. An update moves
    /// the entry to the head; an insert into a full shard evicts the tail.
    pub fn put(&self, key: K, value: Bytes, ttl_ms: i64) {
        let now = now_ms();
        let expiry_ms = if ttl_ms > 0 { now + ttl_ms } else { 0 };

        let mut inner = self.inner.write();

        if let Some(&idx) = inner.map.get(&key) {
            inner.nodes[idx].value = value;
            inner.nodes[idx].expiry_ms = expiry_ms;
            inner.move_to_front(idx);
            self.puts.fetch_add(1, Ordering::Relaxed);
            self.update_peak(inner.map.len());
            return;
        }

        // Link the new head before unlinking the victim, so the map and the
        // list never disagree about membership.
        let idx = inner.alloc(key.clone(), value, expiry_ms);
        inner.push_front(idx);
        inner.map.insert(key, idx);

        while inner.map.len() > self.capacity {
            let victim = inner.tail;
            if victim == NIL || victim == idx {
                break;
            }
            inner.erase(victim);
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        self.puts.fetch_add(1, Ordering::Relaxed);
        self.update_peak(inner.map.len());
    }

    /// True iff the key existed and was removed.
    pub fn remove(&self, key: &K) -> bool {
        let mut inner = self.inner.write();
        match inner.map.get(key) {
            None => false,
            Some(&idx) => {
                inner.erase(idx);
                self.removes.fetch_add(1, Ordering::Relaxed);
                true
            }
        }
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.nodes.clear();
        inner.free.clear();
        inner.map.clear();
        inner.head = NIL;
        inner.tail = NIL;
    }

    pub fn len(&self) -> usize {
        self.inner.read().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of all non-expired entries, newest first.
    pub fn get_all(&self) -> Vec<(K, Bytes)> {
        let now = now_ms();
        let inner = self.inner.read();

        let mut out = Vec::with_capacity(inner.map.len());
        let mut idx = inner.head;
        while idx != NIL {
            let node = &inner.nodes[idx];
            if !is_expired(node.expiry_ms, now) {
                out.push((node.key.clone(), node.value.clone()));
            }
            idx = node.next;
        }
        out
    }

    pub fn stats(&self) -> CacheStats {
        let current_size = self.inner.read().map.len();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
            current_size,
            capacity: self.capacity,
            start_time_ms: self.start_time_ms.load(Ordering::Relaxed),
            last_access_time_ms: self.last_access_time_ms.load(Ordering::Relaxed),
            last_hit_time_ms: self.last_hit_time_ms.load(Ordering::Relaxed),
            last_miss_time_ms: self.last_miss_time_ms.load(Ordering::Relaxed),
            peak_size: self.peak_size.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.expired.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.puts.store(0, Ordering::Relaxed);
        self.removes.store(0, Ordering::Relaxed);
        self.peak_size.store(0, Ordering::Relaxed);
        self.start_time_ms.store(now_unix_ms(), Ordering::Relaxed);
        self.last_access_time_ms.store(0, Ordering::Relaxed);
        self.last_hit_time_ms.store(0, Ordering::Relaxed);
        self.last_miss_time_ms.store(0, Ordering::Relaxed);
    }

    /// Non-blocking exclusive access for the expiration driver. Returns
    /// `None` immediately when a foreground operation holds the shard.
    pub fn try_sweep(&self) -> Option<SweepGuard<'_, K>> {
        self.inner.try_write().map(|inner| SweepGuard {
            shard: self,
            inner,
        })
    }

    fn update_peak(&self, current: usize) {
        let mut peak = self.peak_size.load(Ordering::Relaxed);
        while current > peak {
            match self.peak_size.compare_exchange_weak(
                peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }
    }
}

/// Exclusive shard access held by the expiration driver while it samples
/// and expires. Dropping the guard releases the shard lock.
pub struct SweepGuard<'a, K: CacheKey> {
    shard: &'a CacheShard<K>,
    inner: RwLockWriteGuard<'a, ShardInner<K>>,
}

impl<K: CacheKey> SweepGuard<'_, K> {
    /// Up to `n` keys drawn by a Fisher–Yates partial shuffle over the
    /// current key set.
    pub fn random_sample(&self, n: usize, rng: &mut impl Rng) -> Vec<K> {
        let mut keys: Vec<K> = self.inner.map.keys().cloned().collect();
        let take = n.min(keys.len());
        for i in 0..take {
            let j = rng.gen_range(i..keys.len());
            keys.swap(i, j);
        }
        keys.truncate(take);
        keys
    }

    /// Drop every sampled key whose TTL has elapsed; returns the number of
    /// entries removed.
    pub fn expire_keys(&mut self, keys: &[K]) -> usize {
        let now = now_ms();
        let mut dropped = 0;
        for key in keys {
            if let Some(&idx) = self.inner.map.get(key) {
                if is_expired(self.inner.nodes[idx].expiry_ms, now) {
                    self.inner.erase(idx);
                    dropped += 1;
                }
            }
        }
        if dropped > 0 {
            self.shard.expired.fetch_add(dropped as u64, Ordering::Relaxed);
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.inner.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn bytes(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn basic_put_get() {
        let shard: CacheShard<String> = CacheShard::new(2);
        shard.put("k1".into(), bytes("v1"), 0);
        shard.put("k2".into(), bytes("v2"), 0);

        assert_eq!(shard.get(&"k1".to_string()), Some(bytes("v1")));
        assert_eq!(shard.get(&"kX".to_string()), None);
        assert_eq!(shard.len(), 2);

        let stats = shard.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.puts, 2);
    }

    #[test]
    fn eviction_drops_the_tail() {
        let shard: CacheShard<String> = CacheShard::new(2);
        shard.put("k1".into(), bytes("v1"), 0);
        shard.put("k2".into(), bytes("v2"), 0);
        shard.put("k3".into(), bytes("v3"), 0);

        assert_eq!(shard.get(&"k1".to_string()), None);
        assert_eq!(shard.get(&"k2".to_string()), Some(bytes("v2")));
        assert_eq!(shard.get(&"k3".to_string()), Some(bytes("v3")));
        assert_eq!(shard.stats().evictions, 1);
    }

    #[test]
    fn recent_hit_is_not_the_eviction_victim() {
        let shard: CacheShard<String> = CacheShard::new(3);
        shard.put("a".into(), bytes("1"), 0);
        shard.put("b".into(), bytes("2"), 0);
        shard.put("c".into(), bytes("3"), 0);

        // First hit since construction always promotes (the promote stamp
        // starts at zero), so "a" moves off the tail.
        assert!(shard.get(&"a".to_string()).is_some());

        shard.put("d".into(), bytes("4"), 0);
        assert!(shard.get(&"a".to_string()).is_some());
        // The victim was the oldest untouched entry.
        assert!(shard.get(&"b".to_string()).is_none());
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let shard: CacheShard<u64> = CacheShard::new(8);
        for i in 0..1000u64 {
            shard.put(i, bytes("v"), 0);
            assert!(shard.len() <= 8);
        }
        assert_eq!(shard.len(), 8);
        assert_eq!(shard.stats().evictions, 992);
    }

    #[test]
    fn update_does_not_evict() {
        let shard: CacheShard<String> = CacheShard::new(2);
        shard.put("k1".into(), bytes("a"), 0);
        shard.put("k2".into(), bytes("b"), 0);
        shard.put("k1".into(), bytes("a2"), 0);

        assert_eq!(shard.len(), 2);
        assert_eq!(shard.stats().evictions, 0);
        assert_eq!(shard.get(&"k1".to_string()), Some(bytes("a2")));
    }

    #[test]
    fn expired_entry_is_removed_on_read() {
        let shard: CacheShard<String> = CacheShard::new(4);
        shard.put("temp".into(), bytes("x"), 100);
        assert_eq!(shard.get(&"temp".to_string()), Some(bytes("x")));

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(shard.get(&"temp".to_string()), None);
        assert_eq!(shard.len(), 0);

        let stats = shard.stats();
        assert_eq!(stats.expired, 1);
        // The expired read counts as a miss.
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn remove_reports_presence() {
        let shard: CacheShard<String> = CacheShard::new(4);
        shard.put("k".into(), bytes("v"), 0);
        assert!(shard.remove(&"k".to_string()));
        assert!(!shard.remove(&"k".to_string()));
        assert_eq!(shard.stats().removes, 1);
    }

    #[test]
    fn clear_empties_and_slots_are_reusable() {
        let shard: CacheShard<u32> = CacheShard::new(16);
        for i in 0..16u32 {
            shard.put(i, bytes("v"), 0);
        }
        shard.clear();
        assert!(shard.is_empty());

        for i in 0..16u32 {
            shard.put(i, bytes("w"), 0);
        }
        assert_eq!(shard.len(), 16);
        assert_eq!(shard.get(&7), Some(bytes("w")));
    }

    #[test]
    fn get_all_skips_expired() {
        let shard: CacheShard<String> = CacheShard::new(8);
        shard.put("live".into(), bytes("1"), 0);
        shard.put("dying".into(), bytes("2"), 50);

        std::thread::sleep(Duration::from_millis(80));
        let all = shard.get_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "live");
    }

    #[test]
    fn sweep_expires_sampled_keys() {
        let shard: CacheShard<String> = CacheShard::new(32);
        for i in 0..10 {
            shard.put(format!("short-{}", i), bytes("x"), 30);
        }
        for i in 0..10 {
            shard.put(format!("long-{}", i), bytes("y"), 0);
        }

        std::thread::sleep(Duration::from_millis(60));

        let mut rng = rand::thread_rng();
        let mut guard = shard.try_sweep().expect("shard is uncontended");
        let sample = guard.random_sample(100, &mut rng);
        assert_eq!(sample.len(), 20);

        let dropped = guard.expire_keys(&sample);
        assert_eq!(dropped, 10);
        assert_eq!(guard.len(), 10);
        drop(guard);

        assert_eq!(shard.stats().expired, 10);
    }

    #[test]
    fn try_sweep_fails_under_contention() {
        let shard: CacheShard<String> = CacheShard::new(4);
        let _outer = shard.try_sweep().unwrap();
        // The write lock is held; a second sweep must not block.
        assert!(shard.try_sweep().is_none());
    }

    #[test]
    fn random_sample_bounds() {
        let shard: CacheShard<u32> = CacheShard::new(16);
        for i in 0..5u32 {
            shard.put(i, bytes("v"), 0);
        }
        let mut rng = rand::thread_rng();
        let guard = shard.try_sweep().unwrap();
        assert_eq!(guard.random_sample(3, &mut rng).len(), 3);
        assert_eq!(guard.random_sample(50, &mut rng).len(), 5);
        assert!(guard
            .random_sample(3, &mut rng)
            .iter()
            .all(|k| *k < 5));
    }

    #[test]
    fn reset_stats_keeps_data() {
        let shard: CacheShard<String> = CacheShard::new(4);
        shard.put("k".into(), bytes("v"), 0);
        shard.get(&"k".to_string());
        shard.reset_stats();

        let stats = shard.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.puts, 0);
        assert_eq!(stats.current_size, 1);
        assert_eq!(shard.get(&"k".to_string()), Some(bytes("v")));
    }

    #[test]
    fn peak_size_tracks_high_water_mark() {
        let shard: CacheShard<u32> = CacheShard::new(8);
        for i in 0..8u32 {
            shard.put(i, bytes("v"), 0);
        }
        for i in 0..4u32 {
            shard.remove(&i);
        }
        let stats = shard.stats();
        assert_eq!(stats.peak_size, 8);
        assert_eq!(stats.current_size, 4);
    }
}
