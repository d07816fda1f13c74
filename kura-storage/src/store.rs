//! # Sharded Store
//!
//! Front door of the engine. Keys hash to one of N shards; durable
//! operations additionally append to the WAL. The store owns the global LSN
//! counter, the shard health ledger, and the global consistency lock that
//! checkpoints take exclusively to make "export + WAL truncation" atomic.
//!
//! Lock order, everywhere: consistency lock (shared or exclusive) first,
//! then a shard lock, and the WAL mutex only after the shard lock has been
//! released. Shard locks are leaves.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::hash::Hasher;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use tracing::{debug, error, info, warn};

use kura_core::codec::CacheKey;
use kura_core::config::{ExpirationConfig, PersistenceConfig, StoreConfig};
use kura_core::error::{Error, Result};
use kura_core::stats::CacheStats;
use kura_core::time::now_ms;
use kura_index::codec as vector_codec;
use kura_index::simd;

use crate::expiration::{ExpirationManager, ExpirationStats};
use crate::shard::CacheShard;
use crate::wal::{LogRecord, WalConfig, WalOp, WriteAheadLog};

/// Consecutive shard failures before the health ledger disables a shard.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// Sample size used by manual expiration sweeps.
const MANUAL_SWEEP_SAMPLE: usize = 20;

/// One result of a top-K vector search, ascending by `distance`
/// (squared L2; take the square root for the metric distance).
#[derive(Debug, Clone)]
pub struct SearchHit<K> {
    pub key: K,
    pub distance: f32,
}

impl<K> PartialEq for SearchHit<K> {
    fn eq(&self, other: &Self) -> bool {
        self.distance.total_cmp(&other.distance) == std::cmp::Ordering::Equal
    }
}

impl<K> Eq for SearchHit<K> {}

impl<K> PartialOrd for SearchHit<K> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for SearchHit<K> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.distance.total_cmp(&other.distance)
    }
}

/// Point-in-time view of the shard health ledger.
#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub overall_healthy: bool,
    pub healthy_shards: usize,
    pub total_shards: usize,
    pub disabled_shards: Vec<usize>,
    pub error_counts: HashMap<usize, u32>,
    pub error_rate: f64,
}

/// What a WAL replay applied.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayOutcome {
    pub applied: usize,
    pub errors: usize,
}

struct HealthState {
    error_counts: HashMap<usize, u32>,
    disabled: HashSet<usize>,
    /// Remaining forced failures per shard. Test hook.
    injected_faults: HashMap<usize, u32>,
}

pub struct ShardedStore<K: CacheKey> {
    shards: Vec<CacheShard<K>>,

    /// Held shared by every writer; exclusively only by checkpoints and
    /// whole-store operations (clear, export).
    consistency: RwLock<()>,

    /// Serialises WAL appends and guards the WAL handle itself. Taken only
    /// after shard locks are released.
    wal: Mutex<Option<Arc<WriteAheadLog>>>,
    persistence_enabled: AtomicBool,

    /// Next LSN to assign; starts at 1 and is strictly monotonic.
    lsn: AtomicU64,

    health: Mutex<HealthState>,
    expiration: Mutex<Option<ExpirationManager>>,
}

impl<K: CacheKey> ShardedStore<K> {
    pub fn new(config: StoreConfig) -> Self {
        let shard_count = config.shard_count.max(1);
        let shards = (0..shard_count)
            .map(|_| CacheShard::new(config.capacity_per_shard))
            .collect();

        Self {
            shards,
            consistency: RwLock::new(()),
            wal: Mutex::new(None),
            persistence_enabled: AtomicBool::new(false),
            lsn: AtomicU64::new(1),
            health: Mutex::new(HealthState {
                error_counts: HashMap::new(),
                disabled: HashSet::new(),
                injected_faults: HashMap::new(),
            }),
            expiration: Mutex::new(None),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    fn shard_index(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.shards.len()
    }

    // ========================================================================
    // LSN counter
    // ========================================================================

    /// Atomically assign the next LSN, returning the assigned value.
    pub fn next_lsn(&self) -> u64 {
        self.lsn.fetch_add(1, Ordering::Relaxed)
    }

    /// Last LSN assigned, or 0 when none has been.
    pub fn current_lsn(&self) -> u64 {
        self.lsn.load(Ordering::Relaxed).saturating_sub(1)
    }

    /// Ensure future assignments land strictly after `lsn`. Used after WAL
    /// replay so a recovered store never reuses a replayed LSN.
    fn advance_lsn_past(&self, lsn: u64) {
        self.lsn.fetch_max(lsn + 1, Ordering::Relaxed);
    }

    // ========================================================================
    // Basic cache operations
    // ========================================================================

    /// Look up a key. Reads bypass the consistency lock so they continue
    /// against the shards even while a checkpoint exports.
    pub fn get(&self, key: &K) -> Option<Bytes> {
        let idx = self.shard_index(key);
        match self.shard_op(idx, |shard| shard.get(key)) {
            Ok(found) => found,
            Err(_) => None,
        }
    }

    /// Insert or update. With persistence on, the shard is updated first
    /// and the record is appended after the shard lock is released; a crash
    /// between the two loses only the not-yet-durable record.
    pub fn put(&self, key: K, value: Bytes, ttl_ms: i64) {
        let _consistency = self.consistency.read();

        let idx = self.shard_index(&key);

        let wal_prepared = if self.persistence_enabled.load(Ordering::Relaxed) {
            let lsn = self.next_lsn();
            Some(LogRecord::put(key.encode(), value.clone(), now_ms(), lsn))
        } else {
            None
        };

        if self
            .shard_op(idx, |shard| shard.put(key, value, ttl_ms))
            .is_err()
        {
            return;
        }

        if let Some(record) = wal_prepared {
            self.append_wal(record);
        }
    }

    /// Remove a key; true iff it existed. The DELETE record is only logged
    /// when the shard actually removed something.
    pub fn remove(&self, key: &K) -> bool {
        let _consistency = self.consistency.read();

        let idx = self.shard_index(key);

        let wal_prepared = if self.persistence_enabled.load(Ordering::Relaxed) {
            let lsn = self.next_lsn();
            Some(LogRecord::delete(key.encode(), now_ms(), lsn))
        } else {
            None
        };

        let removed = match self.shard_op(idx, |shard| shard.remove(key)) {
            Ok(removed) => removed,
            Err(_) => return false,
        };

        if removed {
            if let Some(record) = wal_prepared {
                self.append_wal(record);
            }
        }
        removed
    }

    /// Total entries across enabled shards.
    pub fn len(&self) -> usize {
        (0..self.shards.len())
            .filter(|&i| !self.is_shard_disabled(i))
            .map(|i| self.shards[i].len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shards.iter().map(|s| s.capacity()).sum()
    }

    /// Drop every entry in every enabled shard.
    pub fn clear(&self) {
        let _consistency = self.consistency.write();
        for (idx, shard) in self.shards.iter().enumerate() {
            if !self.is_shard_disabled(idx) {
                shard.clear();
            }
        }
    }

    /// Aggregate stats across enabled shards. Never fails because of one
    /// bad shard; disabled shards are simply skipped.
    pub fn stats(&self) -> CacheStats {
        let mut total = CacheStats::default();
        for (idx, shard) in self.shards.iter().enumerate() {
            if !self.is_shard_disabled(idx) {
                total.merge(&shard.stats());
            }
        }
        total
    }

    pub fn reset_stats(&self) {
        for (idx, shard) in self.shards.iter().enumerate() {
            if !self.is_shard_disabled(idx) {
                shard.reset_stats();
            }
        }
    }

    /// Merge every enabled shard's live entries under the exclusive
    /// consistency lock. Writers are blocked for the duration.
    pub fn export_all_data(&self) -> HashMap<K, Bytes> {
        let _consistency = self.consistency.write();
        self.export_locked()
    }

    fn export_locked(&self) -> HashMap<K, Bytes> {
        let mut all = HashMap::new();
        for (idx, shard) in self.shards.iter().enumerate() {
            if self.is_shard_disabled(idx) {
                continue;
            }
            for (key, value) in shard.get_all() {
                all.insert(key, value);
            }
        }
        debug!(entries = all.len(), "exported under consistency lock");
        all
    }

    /// Atomic checkpoint support: under one exclusive acquisition of the
    /// consistency lock, hand the sorted canonical entries and the covered
    /// LSN to `write_snapshot`; if it succeeds, truncate the WAL before the
    /// lock is released. This closes the window in which a crash could see
    /// a snapshot without a matching truncation.
    pub fn checkpoint_with<R>(
        &self,
        write_snapshot: impl FnOnce(&[(Bytes, Bytes)], u64) -> Result<R>,
    ) -> Result<R> {
        let _consistency = self.consistency.write();

        let mut entries: Vec<(Bytes, Bytes)> = self
            .export_locked()
            .into_iter()
            .map(|(k, v)| (k.encode(), v))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let covered_lsn = self.current_lsn();
        let out = write_snapshot(&entries, covered_lsn)?;

        self.clear_wal()?;
        Ok(out)
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Open the WAL under `config.data_dir` and start its background fsync
    /// thread. Idempotent.
    pub fn enable_persistence(&self, config: &PersistenceConfig) -> Result<()> {
        let mut wal_slot = self.wal.lock();
        if wal_slot.is_some() {
            return Ok(());
        }

        let wal = Arc::new(WriteAheadLog::open(WalConfig {
            data_dir: config.data_dir.clone(),
            buffer_size: config.buffer_size_bytes,
            fsync_interval: config.fsync_interval(),
        })?);
        wal.start_background_fsync();

        *wal_slot = Some(wal);
        self.persistence_enabled.store(true, Ordering::SeqCst);
        info!(dir = %config.data_dir.display(), "persistence enabled");
        Ok(())
    }

    /// Stop the fsync thread, flush what is buffered, and drop the WAL.
    pub fn disable_persistence(&self) {
        let mut wal_slot = self.wal.lock();
        self.persistence_enabled.store(false, Ordering::SeqCst);
        if let Some(wal) = wal_slot.take() {
            wal.stop_background_fsync();
            if let Err(e) = wal.flush() {
                error!(error = %e, "final WAL flush failed while disabling persistence");
            }
            info!("persistence disabled");
        }
    }

    pub fn persistence_enabled(&self) -> bool {
        self.persistence_enabled.load(Ordering::Relaxed)
    }

    /// Current WAL footprint (file + buffer), 0 with persistence off.
    pub fn wal_log_size(&self) -> u64 {
        self.wal.lock().as_ref().map(|w| w.log_size()).unwrap_or(0)
    }

    /// Force the WAL buffer to disk.
    pub fn flush_wal(&self) -> Result<()> {
        match self.wal.lock().as_ref() {
            Some(wal) => wal.flush(),
            None => Ok(()),
        }
    }

    /// Truncate the log file. Called by the checkpoint protocol under the
    /// exclusive consistency lock; snapshots on disk are left alone.
    pub fn clear_wal(&self) -> Result<()> {
        match self.wal.lock().as_ref() {
            Some(wal) => wal.truncate_log(),
            None => Ok(()),
        }
    }

    fn append_wal(&self, record: LogRecord) {
        let wal_slot = self.wal.lock();
        if let Some(wal) = wal_slot.as_ref() {
            if let Err(e) = wal.append(&record) {
                // Durability degrades to best-effort; the entry stays
                // committed in memory.
                error!(error = %e, lsn = record.lsn, "WAL append failed");
            }
        }
    }

    /// Load one entry without logging it. Used when loading a snapshot.
    pub fn restore_entry(&self, key: K, value: Bytes, ttl_ms: i64) {
        let idx = self.shard_index(&key);
        self.shards[idx].put(key, value, ttl_ms);
    }

    /// Apply PUT/DELETE records with `lsn > after_lsn` directly to the
    /// shards, without re-logging. Advances the LSN counter past everything
    /// replayed. Replayed entries are immortal: TTLs are not persisted.
    pub fn replay_wal(&self, after_lsn: u64) -> Result<ReplayOutcome> {
        let wal = match self.wal.lock().as_ref() {
            Some(wal) => Arc::clone(wal),
            None => return Ok(ReplayOutcome::default()),
        };

        let records = wal.read_after_lsn(after_lsn)?;
        let mut outcome = ReplayOutcome::default();
        let mut max_lsn = after_lsn;

        for record in records {
            max_lsn = max_lsn.max(record.lsn);
            match record.op {
                WalOp::Put => match K::decode(&record.key) {
                    Ok(key) => {
                        self.restore_entry(key, record.value, 0);
                        outcome.applied += 1;
                    }
                    Err(e) => {
                        warn!(error = %e, lsn = record.lsn, "failed to replay PUT");
                        outcome.errors += 1;
                    }
                },
                WalOp::Delete => match K::decode(&record.key) {
                    Ok(key) => {
                        let idx = self.shard_index(&key);
                        self.shards[idx].remove(&key);
                        outcome.applied += 1;
                    }
                    Err(e) => {
                        warn!(error = %e, lsn = record.lsn, "failed to replay DELETE");
                        outcome.errors += 1;
                    }
                },
                WalOp::Snapshot => {}
            }
        }

        self.advance_lsn_past(max_lsn);
        info!(
            applied = outcome.applied,
            errors = outcome.errors,
            after_lsn,
            "WAL replay complete"
        );
        Ok(outcome)
    }

    // ========================================================================
    // Vector surface
    // ========================================================================

    /// Store a float vector as its raw byte encoding.
    pub fn vector_put(&self, key: K, vector: &[f32], ttl_ms: i64) {
        self.put(key, vector_codec::serialize(vector), ttl_ms);
    }

    /// Decode a stored vector; empty when absent or not float-sized.
    pub fn vector_get(&self, key: &K) -> Vec<f32> {
        match self.get(key) {
            Some(raw) => vector_codec::deserialize(&raw),
            None => Vec::new(),
        }
    }

    /// Top-K nearest neighbours by squared L2, fanning out over all enabled
    /// shards in parallel. Values whose decoded dimension differs from the
    /// query are skipped.
    pub fn vector_search(&self, query: &[f32], k: usize) -> Vec<SearchHit<K>> {
        if query.is_empty() || k == 0 {
            return Vec::new();
        }

        let enabled: Vec<usize> = (0..self.shards.len())
            .filter(|&i| !self.is_shard_disabled(i))
            .collect();

        let per_shard: Vec<Vec<SearchHit<K>>> = enabled
            .par_iter()
            .map(|&idx| {
                let mut heap: BinaryHeap<SearchHit<K>> = BinaryHeap::with_capacity(k + 1);
                for (key, raw) in self.shards[idx].get_all() {
                    if vector_codec::dim_of(&raw) != Some(query.len()) {
                        continue;
                    }
                    let candidate = vector_codec::deserialize(&raw);
                    let distance = simd::l2_sq(query, &candidate);
                    heap.push(SearchHit { key, distance });
                    if heap.len() > k {
                        heap.pop();
                    }
                }
                heap.into_vec()
            })
            .collect();

        let mut merged: BinaryHeap<SearchHit<K>> = BinaryHeap::with_capacity(k + 1);
        for hit in per_shard.into_iter().flatten() {
            merged.push(hit);
            if merged.len() > k {
                merged.pop();
            }
        }

        merged.into_sorted_vec()
    }

    // ========================================================================
    // Expiration service
    // ========================================================================

    /// Start the background sweep for a shared store handle. Idempotent
    /// while running.
    pub fn start_expiration(store: &Arc<Self>, config: &ExpirationConfig) {
        let mut slot = store.expiration.lock();
        if slot.is_some() {
            return;
        }

        let manager = ExpirationManager::new(
            store.shards.len(),
            config.check_interval(),
            config.sample_size,
        );

        let weak: Weak<Self> = Arc::downgrade(store);
        manager.start(move |shard_id, sample_size| match weak.upgrade() {
            Some(store) => store.sweep_shard(shard_id, sample_size),
            None => 0,
        });

        *slot = Some(manager);
    }

    pub fn stop_expiration(&self) {
        if let Some(manager) = self.expiration.lock().take() {
            manager.stop();
        }
    }

    pub fn expiration_stats(&self) -> Option<ExpirationStats> {
        self.expiration.lock().as_ref().map(|m| m.stats())
    }

    /// One sweep over a single shard (or all shards) right now, bypassing
    /// the background schedule.
    pub fn manual_expiration(&self, shard_id: Option<usize>) -> usize {
        match shard_id {
            Some(id) => self.sweep_shard(id, MANUAL_SWEEP_SAMPLE),
            None => (0..self.shards.len())
                .map(|id| self.sweep_shard(id, MANUAL_SWEEP_SAMPLE))
                .sum(),
        }
    }

    /// The expiration callback: try the shard lock; on contention return 0
    /// without waiting, so the sweep never blocks foreground traffic.
    fn sweep_shard(&self, shard_id: usize, sample_size: usize) -> usize {
        if shard_id >= self.shards.len() || self.is_shard_disabled(shard_id) {
            return 0;
        }

        let Some(mut guard) = self.shards[shard_id].try_sweep() else {
            return 0;
        };

        let mut rng = rand::thread_rng();
        let keys = guard.random_sample(sample_size, &mut rng);
        guard.expire_keys(&keys)
    }

    // ========================================================================
    // Shard health
    // ========================================================================

    fn shard_op<T>(&self, idx: usize, f: impl FnOnce(&CacheShard<K>) -> T) -> Result<T> {
        if self.is_shard_disabled(idx) {
            return Err(Error::ShardDisabled);
        }
        if self.take_injected_fault(idx) {
            self.record_shard_error(idx);
            return Err(Error::Internal {
                message: format!("injected fault on shard {}", idx),
            });
        }
        let out = f(&self.shards[idx]);
        self.record_shard_success(idx);
        Ok(out)
    }

    fn record_shard_error(&self, idx: usize) {
        let mut health = self.health.lock();
        let state = &mut *health;
        let count = state.error_counts.entry(idx).or_insert(0);
        *count += 1;
        if *count >= MAX_CONSECUTIVE_ERRORS && state.disabled.insert(idx) {
            warn!(shard = idx, errors = *count, "shard disabled");
        }
    }

    fn record_shard_success(&self, idx: usize) {
        let mut health = self.health.lock();
        if let Some(count) = health.error_counts.get_mut(&idx) {
            *count = 0;
        }
    }

    fn is_shard_disabled(&self, idx: usize) -> bool {
        self.health.lock().disabled.contains(&idx)
    }

    fn take_injected_fault(&self, idx: usize) -> bool {
        let mut health = self.health.lock();
        match health.injected_faults.get_mut(&idx) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }

    /// Force the next `failures` operations on `shard_id` to fail.
    /// Test hook for the shard-isolation path.
    #[doc(hidden)]
    pub fn inject_shard_fault(&self, shard_id: usize, failures: u32) {
        self.health.lock().injected_faults.insert(shard_id, failures);
    }

    pub fn health_status(&self) -> HealthStatus {
        let health = self.health.lock();
        let total_shards = self.shards.len();
        let healthy_shards = total_shards - health.disabled.len();

        let total_errors: u32 = health.error_counts.values().sum();
        let mut disabled: Vec<usize> = health.disabled.iter().copied().collect();
        disabled.sort_unstable();

        HealthStatus {
            overall_healthy: healthy_shards > total_shards / 2,
            healthy_shards,
            total_shards,
            disabled_shards: disabled,
            error_counts: health.error_counts.clone(),
            error_rate: f64::from(total_errors)
                / (total_shards as f64 * f64::from(MAX_CONSECUTIVE_ERRORS)),
        }
    }

    /// Probe each disabled shard with a trivial read and re-enable the ones
    /// that answer.
    pub fn perform_health_check(&self) {
        let disabled: Vec<usize> = {
            let health = self.health.lock();
            health.disabled.iter().copied().collect()
        };

        for idx in disabled {
            if self.take_injected_fault(idx) {
                continue;
            }
            let _probe = self.shards[idx].len();

            let mut health = self.health.lock();
            health.error_counts.insert(idx, 0);
            if health.disabled.remove(&idx) {
                info!(shard = idx, "shard recovered and re-enabled");
            }
        }
    }
}

impl<K: CacheKey> Drop for ShardedStore<K> {
    fn drop(&mut self) {
        self.stop_expiration();
        self.disable_persistence();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bytes(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn small_store() -> ShardedStore<String> {
        ShardedStore::new(StoreConfig {
            capacity_per_shard: 16,
            shard_count: 4,
        })
    }

    #[test]
    fn routing_is_stable() {
        let store = small_store();
        let key = "some-key".to_string();
        let idx = store.shard_index(&key);
        for _ in 0..100 {
            assert_eq!(store.shard_index(&key), idx);
        }
    }

    #[test]
    fn lsn_counter_starts_at_one() {
        let store = small_store();
        assert_eq!(store.current_lsn(), 0);
        assert_eq!(store.next_lsn(), 1);
        assert_eq!(store.next_lsn(), 2);
        assert_eq!(store.current_lsn(), 2);
    }

    #[test]
    fn lsn_advances_past_replayed_records() {
        let store = small_store();
        store.advance_lsn_past(41);
        assert_eq!(store.next_lsn(), 42);
        // Advancing backwards is a no-op.
        store.advance_lsn_past(3);
        assert_eq!(store.next_lsn(), 43);
    }

    #[test]
    fn disabled_shard_short_circuits() {
        let store = small_store();
        let key = "victim".to_string();
        let idx = store.shard_index(&key);

        store.put(key.clone(), bytes("v"), 0);
        store.inject_shard_fault(idx, MAX_CONSECUTIVE_ERRORS);
        for _ in 0..MAX_CONSECUTIVE_ERRORS {
            assert_eq!(store.get(&key), None);
        }

        let health = store.health_status();
        assert_eq!(health.disabled_shards, vec![idx]);

        // Short-circuited: no fault left to consume, still None.
        assert_eq!(store.get(&key), None);
        store.put(key.clone(), bytes("ignored"), 0);
        assert!(!store.remove(&key));

        store.perform_health_check();
        assert!(store.health_status().disabled_shards.is_empty());
        assert_eq!(store.get(&key), Some(bytes("v")));
    }

    #[test]
    fn export_merges_all_shards() {
        let store = small_store();
        for i in 0..20 {
            store.put(format!("k{}", i), bytes("v"), 0);
        }
        let exported = store.export_all_data();
        assert_eq!(exported.len(), 20);
        assert!(exported.contains_key("k7"));
    }

    #[test]
    fn search_hit_ordering_is_by_distance() {
        let mut heap = BinaryHeap::new();
        for (key, distance) in [("far", 9.0f32), ("near", 1.0), ("mid", 4.0)] {
            heap.push(SearchHit {
                key: key.to_string(),
                distance,
            });
        }
        let sorted = heap.into_sorted_vec();
        assert_eq!(sorted[0].key, "near");
        assert_eq!(sorted[2].key, "far");
    }

    #[test]
    fn manual_expiration_drops_expired_entries() {
        let store = small_store();
        for i in 0..12 {
            store.put(format!("temp{}", i), bytes("x"), 30);
        }
        store.put("keeper".into(), bytes("y"), 0);

        std::thread::sleep(std::time::Duration::from_millis(60));
        let dropped = store.manual_expiration(None);
        assert_eq!(dropped, 12);
        assert_eq!(store.len(), 1);
    }
}
