//! # Configuration
//!
//! Caller-provided configuration for the KuraKV engine. Defaults follow the
//! values the engine was tuned with: 100ms expiration sweeps sampling 20
//! keys, 1s background fsync, 64MiB/60min checkpoint triggers.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store: StoreConfig,
    pub persistence: PersistenceConfig,
    pub expiration: ExpirationConfig,
    pub checkpoint: CheckpointConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            persistence: PersistenceConfig::default(),
            expiration: ExpirationConfig::default(),
            checkpoint: CheckpointConfig::default(),
        }
    }
}

/// Sharded store sizing. `shard_count` is fixed for the lifetime of a store;
/// resizing would require a full re-hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub capacity_per_shard: usize,
    pub shard_count: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            capacity_per_shard: 64 * 1024,
            shard_count: 16,
        }
    }
}

/// WAL persistence tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub data_dir: PathBuf,
    /// Interval between background fsyncs of the WAL buffer.
    pub fsync_interval_ms: u32,
    /// In-memory WAL buffer; appends that would overflow it flush first.
    pub buffer_size_bytes: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            fsync_interval_ms: 1000,
            buffer_size_bytes: 1024 * 1024,
        }
    }
}

impl PersistenceConfig {
    pub fn fsync_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.fsync_interval_ms))
    }
}

/// Active-expiration sweep tuning. The 100ms/20-key defaults amortise the
/// cost of TTL cleanup without stalling foreground traffic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpirationConfig {
    pub check_interval_ms: u32,
    pub sample_size: usize,
}

impl Default for ExpirationConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: 100,
            sample_size: 20,
        }
    }
}

impl ExpirationConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(u64::from(self.check_interval_ms))
    }
}

/// Checkpoint trigger policy and snapshot retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub data_dir: PathBuf,
    /// Size trigger: checkpoint once the WAL reaches this many bytes.
    pub wal_size_threshold_bytes: u64,
    /// Time trigger: checkpoint at least this often regardless of WAL size.
    pub time_threshold_minutes: u32,
    /// How often the background checker re-evaluates the triggers.
    pub check_interval_minutes: u32,
    /// Snapshot rotation keeps the newest N files.
    pub keep_snapshot_count: u32,
    pub auto_cleanup: bool,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            wal_size_threshold_bytes: 64 * 1024 * 1024,
            time_threshold_minutes: 60,
            check_interval_minutes: 10,
            keep_snapshot_count: 3,
            auto_cleanup: true,
        }
    }
}

impl CheckpointConfig {
    pub fn time_threshold(&self) -> Duration {
        Duration::from_secs(u64::from(self.time_threshold_minutes) * 60)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.check_interval_minutes) * 60)
    }
}
