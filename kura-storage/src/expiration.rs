//! # Expiration Driver
//!
//! Periodic task that visits shards in turn, asking each (through a
//! store-provided callback) to try-lock, sample keys, and drop the expired
//! ones. The callback must return 0 without waiting when the shard lock is
//! contended, so the sweep never stalls foreground traffic.
//!
//! A zero return is folded into `total_skipped`; a legitimate "sampled but
//! nothing expired" pass is indistinguishable from a lock skip at this
//! layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

/// Aggregate sweep counters.
#[derive(Debug, Clone, Default)]
pub struct ExpirationStats {
    /// Completed passes over all shards.
    pub total_checks: u64,
    /// Entries dropped across all passes.
    pub total_expired: u64,
    /// Shard visits that returned zero (lock skip or nothing to drop).
    pub total_skipped: u64,
    /// Mean of the per-pass expired ratios.
    pub avg_expired_ratio: f64,
}

struct StatsInner {
    total_checks: u64,
    total_expired: u64,
    total_skipped: u64,
    expired_ratios: Vec<f64>,
}

/// Maximum retained ratio samples; the history is halved at the cap.
const RATIO_HISTORY_CAP: usize = 1000;

pub struct ExpirationManager {
    shard_count: usize,
    check_interval: Duration,
    sample_size: usize,
    running: Arc<AtomicBool>,
    stats: Arc<Mutex<StatsInner>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ExpirationManager {
    pub fn new(shard_count: usize, check_interval: Duration, sample_size: usize) -> Self {
        Self {
            shard_count,
            check_interval,
            sample_size,
            running: Arc::new(AtomicBool::new(false)),
            stats: Arc::new(Mutex::new(StatsInner {
                total_checks: 0,
                total_expired: 0,
                total_skipped: 0,
                expired_ratios: Vec::with_capacity(RATIO_HISTORY_CAP),
            })),
            worker: Mutex::new(None),
        }
    }

    /// Spin the sweep thread. `callback(shard_id, sample_size)` is expected
    /// to try the shard lock and return the number of entries it expired,
    /// or 0 when the lock was contended.
    pub fn start<F>(&self, callback: F)
    where
        F: Fn(usize, usize) -> usize + Send + 'static,
    {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("expiration manager already running, ignoring start");
            return;
        }

        let running = Arc::clone(&self.running);
        let stats = Arc::clone(&self.stats);
        let shard_count = self.shard_count;
        let sample_size = self.sample_size;
        let check_interval = self.check_interval;

        let handle = std::thread::Builder::new()
            .name("kura-expiration".into())
            .spawn(move || {
                info!(
                    shard_count,
                    sample_size,
                    interval_ms = check_interval.as_millis() as u64,
                    "expiration sweep started"
                );

                while running.load(Ordering::Relaxed) {
                    let pass_start = Instant::now();

                    let mut expired_this_pass: u64 = 0;
                    let mut skipped_this_pass: u64 = 0;

                    for shard_id in 0..shard_count {
                        if !running.load(Ordering::Relaxed) {
                            break;
                        }
                        let expired = callback(shard_id, sample_size);
                        if expired == 0 {
                            skipped_this_pass += 1;
                        } else {
                            expired_this_pass += expired as u64;
                        }
                    }

                    {
                        let mut s = stats.lock();
                        s.total_checks += 1;
                        s.total_expired += expired_this_pass;
                        s.total_skipped += skipped_this_pass;

                        if expired_this_pass > 0 {
                            let denom = (shard_count * sample_size).max(1);
                            s.expired_ratios
                                .push(expired_this_pass as f64 / denom as f64);
                            if s.expired_ratios.len() > RATIO_HISTORY_CAP {
                                let half = s.expired_ratios.len() / 2;
                                s.expired_ratios.drain(..half);
                            }
                        }

                        if s.total_checks % 100 == 0 {
                            debug!(
                                pass = s.total_checks,
                                expired = expired_this_pass,
                                skipped = skipped_this_pass,
                                "expiration pass"
                            );
                        }
                    }

                    let elapsed = pass_start.elapsed();
                    if elapsed < check_interval {
                        std::thread::sleep(check_interval - elapsed);
                    }
                }

                info!("expiration sweep stopped");
            })
            .expect("failed to spawn expiration thread");

        *self.worker.lock() = Some(handle);
    }

    /// Clear the running flag and join the sweep thread.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.worker.lock().take() {
            // Never join from the sweep thread itself; the store's Drop can
            // run here when the callback holds the last reference.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ExpirationStats {
        let s = self.stats.lock();
        let avg = if s.expired_ratios.is_empty() {
            0.0
        } else {
            s.expired_ratios.iter().sum::<f64>() / s.expired_ratios.len() as f64
        };
        ExpirationStats {
            total_checks: s.total_checks,
            total_expired: s.total_expired,
            total_skipped: s.total_skipped,
            avg_expired_ratio: avg,
        }
    }
}

impl Drop for ExpirationManager {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn sweep_visits_every_shard() {
        let visits = Arc::new(AtomicUsize::new(0));
        let manager = ExpirationManager::new(4, Duration::from_millis(10), 20);

        let counter = Arc::clone(&visits);
        manager.start(move |shard_id, sample_size| {
            assert!(shard_id < 4);
            assert_eq!(sample_size, 20);
            counter.fetch_add(1, Ordering::Relaxed);
            0
        });

        std::thread::sleep(Duration::from_millis(100));
        manager.stop();

        let total = visits.load(Ordering::Relaxed);
        assert!(total >= 4, "expected at least one full pass, got {}", total);
        // Shard visits come in multiples of the shard count per pass, minus
        // at most one partial pass at shutdown.
        let stats = manager.stats();
        assert!(stats.total_checks >= 1);
        assert_eq!(stats.total_expired, 0);
        assert!(stats.total_skipped >= 4);
    }

    #[test]
    fn expired_counts_accumulate() {
        let manager = ExpirationManager::new(2, Duration::from_millis(5), 10);
        manager.start(move |shard_id, _| if shard_id == 0 { 3 } else { 0 });

        std::thread::sleep(Duration::from_millis(60));
        manager.stop();

        let stats = manager.stats();
        assert!(stats.total_checks >= 2);
        // The final pass may be cut short by stop(); every complete pass
        // contributes exactly 3 expired and 1 skip.
        assert!(stats.total_expired >= (stats.total_checks - 1) * 3);
        assert!(stats.total_expired <= stats.total_checks * 3);
        assert!(stats.total_skipped <= stats.total_checks);
        assert!(stats.avg_expired_ratio > 0.0);
    }

    #[test]
    fn stop_is_idempotent_and_double_start_is_ignored() {
        let manager = ExpirationManager::new(1, Duration::from_millis(5), 1);
        manager.start(|_, _| 0);
        assert!(manager.is_running());
        manager.start(|_, _| panic!("second callback must not be installed"));

        manager.stop();
        manager.stop();
        assert!(!manager.is_running());
    }
}
