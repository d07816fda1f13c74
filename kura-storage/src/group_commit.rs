//! # Group Commit
//!
//! Batches multiple durability requests behind a single fsync. Producers
//! enqueue `{bytes, completion}`; the coordinator thread wakes when either
//! the accumulated bytes reach `batch_size` or the current batch has been
//! open for `sync_interval`, writes the whole batch through the append
//! file, fsyncs once, and answers every completion with the same verdict.
//!
//! Invariant: all requests in one batch observe the same durability outcome.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use kura_core::error::Result;

use crate::append_file::AppendFile;

#[derive(Debug, Clone)]
pub struct GroupCommitConfig {
    /// Byte threshold that triggers an immediate sync.
    pub batch_size: usize,
    /// Maximum time a batch stays open before it is synced anyway.
    pub sync_interval: Duration,
}

impl Default for GroupCommitConfig {
    fn default() -> Self {
        Self {
            batch_size: 4096,
            sync_interval: Duration::from_millis(10),
        }
    }
}

/// Aggregate coordinator counters.
#[derive(Debug, Clone, Default)]
pub struct GroupCommitStats {
    pub total_commits: u64,
    pub total_batches: u64,
    pub total_bytes: u64,
    pub avg_batch_len: f64,
}

struct Request {
    data: Vec<u8>,
    done: mpsc::Sender<bool>,
}

struct Queue {
    requests: VecDeque<Request>,
    batch_bytes: usize,
    batch_start: Instant,
}

struct Inner {
    batch_size: usize,
    sync_interval: Duration,
    running: AtomicBool,
    queue: Mutex<Queue>,
    cond: Condvar,
    file: Mutex<AppendFile>,
    stats: Mutex<GroupCommitStats>,
}

impl Inner {
    fn should_sync(&self, queue: &Queue) -> bool {
        queue.batch_bytes >= self.batch_size || queue.batch_start.elapsed() >= self.sync_interval
    }

    /// Drain the queue and push the batch through one write + one fsync.
    /// Every drained completion gets the batch verdict.
    fn process_batch(&self) {
        let batch: Vec<Request> = {
            let mut queue = self.queue.lock();
            if queue.requests.is_empty() {
                return;
            }
            queue.batch_bytes = 0;
            queue.batch_start = Instant::now();
            queue.requests.drain(..).collect()
        };

        let batch_bytes: usize = batch.iter().map(|r| r.data.len()).sum();

        let success = {
            let mut file = self.file.lock();
            let write = batch
                .iter()
                .try_for_each(|request| file.append(&request.data))
                .and_then(|()| file.sync());
            match write {
                Ok(()) => true,
                Err(e) => {
                    error!(error = %e, "group commit batch failed");
                    false
                }
            }
        };

        if success {
            let mut stats = self.stats.lock();
            stats.total_commits += batch.len() as u64;
            stats.total_batches += 1;
            stats.total_bytes += batch_bytes as u64;
        }

        for request in batch {
            // A dropped receiver just means the committer stopped waiting.
            let _ = request.done.send(success);
        }
    }

    fn worker_loop(&self) {
        debug!("group commit worker started");
        while self.running.load(Ordering::Relaxed) {
            {
                let mut queue = self.queue.lock();
                while self.running.load(Ordering::Relaxed)
                    && !(!queue.requests.is_empty() && self.should_sync(&queue))
                {
                    let timed_out = self
                        .cond
                        .wait_for(&mut queue, self.sync_interval)
                        .timed_out();
                    if timed_out && !queue.requests.is_empty() {
                        break;
                    }
                }
            }
            self.process_batch();
        }
        // Answer everything still queued before the thread exits.
        self.process_batch();
        debug!("group commit worker stopped");
    }
}

/// Coordinator handle. Construction opens the target file and starts the
/// worker; drop stops it after draining the queue.
pub struct GroupCommit {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl GroupCommit {
    pub fn open(path: impl AsRef<Path>, config: GroupCommitConfig) -> Result<Self> {
        let file = AppendFile::open(path)?;

        let inner = Arc::new(Inner {
            batch_size: config.batch_size,
            sync_interval: config.sync_interval,
            running: AtomicBool::new(true),
            queue: Mutex::new(Queue {
                requests: VecDeque::new(),
                batch_bytes: 0,
                batch_start: Instant::now(),
            }),
            cond: Condvar::new(),
            file: Mutex::new(file),
            stats: Mutex::new(GroupCommitStats::default()),
        });

        let worker_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("kura-group-commit".into())
            .spawn(move || worker_inner.worker_loop())
            .expect("failed to spawn group commit worker");

        Ok(Self {
            inner,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Enqueue bytes and receive the batch verdict later.
    pub fn submit(&self, data: Vec<u8>) -> mpsc::Receiver<bool> {
        let (tx, rx) = mpsc::channel();

        if !self.inner.running.load(Ordering::Relaxed) {
            let _ = tx.send(false);
            return rx;
        }

        {
            let mut queue = self.inner.queue.lock();
            queue.batch_bytes += data.len();
            if queue.requests.is_empty() {
                queue.batch_start = Instant::now();
            }
            queue.requests.push_back(Request { data, done: tx });
        }
        self.inner.cond.notify_one();
        rx
    }

    /// Synchronous commit: blocks until this request's batch has been
    /// written and fsynced, returning the shared verdict.
    pub fn commit(&self, data: Vec<u8>) -> bool {
        self.submit(data).recv().unwrap_or(false)
    }

    /// Force the current queue through a batch immediately.
    pub fn flush(&self) {
        self.inner.process_batch();
    }

    pub fn stats(&self) -> GroupCommitStats {
        let mut stats = self.inner.stats.lock().clone();
        stats.avg_batch_len = if stats.total_batches > 0 {
            stats.total_commits as f64 / stats.total_batches as f64
        } else {
            0.0
        };
        stats
    }

    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.cond.notify_all();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GroupCommit {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_commit_lands_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gc.log");
        let gc = GroupCommit::open(&path, GroupCommitConfig::default()).unwrap();

        assert!(gc.commit(b"hello".to_vec()));
        gc.stop();

        assert_eq!(std::fs::read(&path).unwrap(), b"hello");
    }

    #[test]
    fn concurrent_commits_share_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gc.log");
        let gc = Arc::new(
            GroupCommit::open(
                &path,
                GroupCommitConfig {
                    batch_size: 64,
                    sync_interval: Duration::from_millis(5),
                },
            )
            .unwrap(),
        );

        let mut handles = Vec::new();
        for t in 0..8 {
            let gc = Arc::clone(&gc);
            handles.push(std::thread::spawn(move || {
                for i in 0..25 {
                    assert!(gc.commit(format!("t{}-{};", t, i).into_bytes()));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let stats = gc.stats();
        assert_eq!(stats.total_commits, 200);
        assert!(stats.total_batches >= 1);
        assert!(stats.total_batches <= stats.total_commits);
        assert!(stats.avg_batch_len >= 1.0);
        gc.stop();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches(';').count(), 200);
    }

    #[test]
    fn commit_after_stop_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let gc = GroupCommit::open(dir.path().join("gc.log"), GroupCommitConfig::default()).unwrap();
        gc.stop();
        assert!(!gc.commit(b"late".to_vec()));
    }

    #[test]
    fn time_trigger_flushes_small_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gc.log");
        let gc = GroupCommit::open(
            &path,
            GroupCommitConfig {
                batch_size: 1024 * 1024,
                sync_interval: Duration::from_millis(5),
            },
        )
        .unwrap();

        // Far below the byte threshold; only the interval can trigger.
        assert!(gc.commit(b"tiny".to_vec()));
        assert_eq!(std::fs::read(&path).unwrap(), b"tiny");
        gc.stop();
    }
}
