//! # Checkpoint Manager
//!
//! Turns the WAL-plus-memory state into a durable snapshot and truncates
//! the log. Triggered by either elapsed time or WAL size; both the export
//! and the truncation happen under one exclusive acquisition of the store's
//! consistency lock, so a crash can never observe a snapshot whose records
//! are also still pending in the old WAL without replay being idempotent.
//!
//! Recovery is the inverse: newest snapshot first, then the WAL tail with
//! LSNs past the snapshot's header LSN.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};

use kura_core::codec::CacheKey;
use kura_core::config::CheckpointConfig;
use kura_core::error::Result;
use kura_core::time::now_ms;

use crate::snapshot;
use crate::store::ShardedStore;
use crate::wal::SNAPSHOTS_DIR_NAME;

/// Checkpoint lifecycle counters.
#[derive(Debug, Clone)]
pub struct CheckpointStats {
    pub last_checkpoint_time: i64,
    pub last_checkpoint_records: usize,
    pub total_checkpoints: u64,
    pub avg_checkpoint_duration: Duration,
    pub last_snapshot_file: Option<PathBuf>,
}

pub struct CheckpointManager<K: CacheKey> {
    store: Arc<ShardedStore<K>>,
    config: CheckpointConfig,
    stats: Mutex<CheckpointStats>,
    running: Arc<AtomicBool>,
    /// Parked-on by the background checker so stop() can interrupt the
    /// inter-check sleep.
    sleep_lock: Mutex<()>,
    sleep_cond: Condvar,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<K: CacheKey> CheckpointManager<K> {
    pub fn new(store: Arc<ShardedStore<K>>, config: CheckpointConfig) -> Result<Self> {
        let snapshots_dir = config.data_dir.join(SNAPSHOTS_DIR_NAME);
        fs::create_dir_all(&snapshots_dir)
            .map_err(|e| kura_core::error::Error::io("create snapshots dir", e))?;

        info!(
            data_dir = %config.data_dir.display(),
            wal_threshold_mb = config.wal_size_threshold_bytes / (1024 * 1024),
            time_threshold_min = config.time_threshold_minutes,
            keep = config.keep_snapshot_count,
            "checkpoint manager initialised"
        );

        Ok(Self {
            store,
            config,
            stats: Mutex::new(CheckpointStats {
                last_checkpoint_time: now_ms(),
                last_checkpoint_records: 0,
                total_checkpoints: 0,
                avg_checkpoint_duration: Duration::ZERO,
                last_snapshot_file: None,
            }),
            running: Arc::new(AtomicBool::new(false)),
            sleep_lock: Mutex::new(()),
            sleep_cond: Condvar::new(),
            worker: Mutex::new(None),
        })
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.config.data_dir.join(SNAPSHOTS_DIR_NAME)
    }

    /// Trigger policy: time since the last checkpoint, or WAL size.
    pub fn should_checkpoint(&self) -> bool {
        let last = self.stats.lock().last_checkpoint_time;
        let elapsed_ms = now_ms().saturating_sub(last);
        if elapsed_ms >= self.config.time_threshold().as_millis() as i64 {
            return true;
        }

        self.store.wal_log_size() >= self.config.wal_size_threshold_bytes
    }

    /// The atomic checkpoint protocol: export + snapshot write + WAL
    /// truncation under one exclusive hold of the consistency lock, then
    /// stats and rotation.
    pub fn checkpoint_now(&self) -> Result<()> {
        let started = Instant::now();
        let timestamp = now_ms();
        let path = self.snapshots_dir().join(snapshot::snapshot_file_name(timestamp));

        let record_count = self.store.checkpoint_with(|entries, covered_lsn| {
            snapshot::write_snapshot(&path, entries, covered_lsn, timestamp)?;
            info!(
                path = %path.display(),
                records = entries.len(),
                wal_lsn = covered_lsn,
                "snapshot written"
            );
            Ok(entries.len())
        })?;

        let duration = started.elapsed();
        {
            let mut stats = self.stats.lock();
            stats.last_checkpoint_time = timestamp;
            stats.last_checkpoint_records = record_count;
            stats.total_checkpoints += 1;
            stats.last_snapshot_file = Some(path);

            let n = stats.total_checkpoints;
            let prior = stats.avg_checkpoint_duration.as_millis() as u64 * (n - 1);
            stats.avg_checkpoint_duration =
                Duration::from_millis((prior + duration.as_millis() as u64) / n);
        }

        if self.config.auto_cleanup {
            self.cleanup_old_snapshots();
        }

        info!(
            records = record_count,
            duration_ms = duration.as_millis() as u64,
            "checkpoint complete"
        );
        Ok(())
    }

    /// Delete all but the newest `keep_snapshot_count` snapshots.
    pub fn cleanup_old_snapshots(&self) {
        let keep = self.config.keep_snapshot_count as usize;
        let snapshots = match snapshot::list_snapshots(&self.snapshots_dir()) {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "failed to list snapshots for rotation");
                return;
            }
        };

        for (ts, path) in snapshots.into_iter().skip(keep) {
            match fs::remove_file(&path) {
                Ok(()) => info!(timestamp = ts, path = %path.display(), "rotated old snapshot"),
                Err(e) => warn!(error = %e, path = %path.display(), "failed to rotate snapshot"),
            }
        }
    }

    /// Rebuild the store from disk: load the newest valid snapshot, then
    /// replay the WAL tail past the snapshot's LSN. Returns the number of
    /// entries applied. A corrupt snapshot aborts before anything loads.
    pub fn recover_from_disk(&self) -> Result<usize> {
        let snapshots = snapshot::list_snapshots(&self.snapshots_dir())?;

        let mut loaded = 0usize;
        let mut snapshot_lsn = 0u64;

        if let Some((ts, path)) = snapshots.first() {
            info!(timestamp = *ts, path = %path.display(), "recovering from snapshot");
            let (raw_entries, lsn) = snapshot::read_snapshot(path)?;
            snapshot_lsn = lsn;

            // Decode everything before touching the store, so a bad record
            // cannot leave a half-loaded state behind.
            let mut decoded = Vec::with_capacity(raw_entries.len());
            for (raw_key, value) in raw_entries {
                let key = K::decode(&raw_key)?;
                decoded.push((key, value));
            }

            // TTLs are not persisted; recovered entries are immortal.
            for (key, value) in decoded {
                self.store.restore_entry(key, value, 0);
                loaded += 1;
            }
            info!(records = loaded, wal_lsn = snapshot_lsn, "snapshot loaded");
        } else {
            info!("no snapshot found, replaying WAL from the beginning");
        }

        let replay = self.store.replay_wal(snapshot_lsn)?;
        info!(
            snapshot_records = loaded,
            wal_records = replay.applied,
            replay_errors = replay.errors,
            total = self.store.len(),
            "recovery complete"
        );

        Ok(loaded + replay.applied)
    }

    pub fn stats(&self) -> CheckpointStats {
        self.stats.lock().clone()
    }

    /// Background checker for a shared manager handle: every
    /// `check_interval`, evaluate the trigger policy and checkpoint when it
    /// fires. Failures are logged, never propagated.
    pub fn start_background_checker(manager: &Arc<Self>) {
        if manager.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(manager);
        let running = Arc::clone(&manager.running);
        let interval = manager.config.check_interval();

        let handle = std::thread::Builder::new()
            .name("kura-checkpoint".into())
            .spawn(move || {
                info!(interval_secs = interval.as_secs(), "checkpoint checker started");
                loop {
                    {
                        let Some(manager) = weak.upgrade() else { break };
                        let mut guard = manager.sleep_lock.lock();
                        if !running.load(Ordering::Relaxed) {
                            break;
                        }
                        let _ = manager.sleep_cond.wait_for(&mut guard, interval);
                    }

                    if !running.load(Ordering::Relaxed) {
                        break;
                    }
                    let Some(manager) = weak.upgrade() else { break };

                    if manager.should_checkpoint() {
                        info!("trigger policy fired, checkpointing");
                        if let Err(e) = manager.checkpoint_now() {
                            error!(error = %e, "automatic checkpoint failed");
                        }
                    }
                }
                info!("checkpoint checker stopped");
            })
            .expect("failed to spawn checkpoint checker");

        *manager.worker.lock() = Some(handle);
    }

    pub fn stop_background_checker(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        {
            let _guard = self.sleep_lock.lock();
            self.sleep_cond.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            // The checker can run this drop path itself when it holds the
            // last Arc; joining your own thread would never return.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl<K: CacheKey> Drop for CheckpointManager<K> {
    fn drop(&mut self) {
        self.stop_background_checker();
    }
}
