//! # Cache Statistics
//!
//! Per-shard counters and the derived ratios exposed for monitoring.
//! Counters are maintained with relaxed atomics inside each shard; this
//! struct is the point-in-time snapshot handed to callers and summed across
//! shards by the store.

use serde::{Deserialize, Serialize};

/// Snapshot of one shard's counters, or the aggregate across all shards.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    // Basic counters
    pub hits: u64,
    pub misses: u64,
    /// Entries removed because their TTL elapsed (lazy or active path).
    pub expired: u64,
    /// Entries removed because the shard was at capacity.
    pub evictions: u64,
    pub puts: u64,
    pub removes: u64,
    pub current_size: usize,
    pub capacity: usize,

    // Timestamps (unix millis)
    pub start_time_ms: u64,
    pub last_access_time_ms: u64,
    pub last_hit_time_ms: u64,
    pub last_miss_time_ms: u64,

    // Peaks
    pub peak_size: usize,
}

impl CacheStats {
    pub fn total_gets(&self) -> u64 {
        self.hits + self.misses
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        }
    }

    pub fn miss_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total > 0 {
            self.misses as f64 / total as f64
        } else {
            0.0
        }
    }

    /// Share of misses explained by TTL expiry.
    pub fn expiry_rate(&self) -> f64 {
        if self.misses > 0 {
            self.expired as f64 / self.misses as f64
        } else {
            0.0
        }
    }

    pub fn usage_rate(&self) -> f64 {
        if self.capacity > 0 {
            self.current_size as f64 / self.capacity as f64
        } else {
            0.0
        }
    }

    pub fn uptime_seconds(&self) -> f64 {
        if self.start_time_ms == 0 || self.last_access_time_ms == 0 {
            return 0.0;
        }
        self.last_access_time_ms.saturating_sub(self.start_time_ms) as f64 / 1000.0
    }

    pub fn avg_qps(&self) -> f64 {
        let uptime = self.uptime_seconds();
        if uptime > 0.0 {
            (self.hits + self.misses) as f64 / uptime
        } else {
            0.0
        }
    }

    /// Fold another shard's snapshot into this aggregate. Counters add;
    /// timestamps take the most recent; start time takes the earliest.
    pub fn merge(&mut self, other: &CacheStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.expired += other.expired;
        self.evictions += other.evictions;
        self.puts += other.puts;
        self.removes += other.removes;
        self.current_size += other.current_size;
        self.capacity += other.capacity;
        self.peak_size += other.peak_size;

        if self.start_time_ms == 0 || (other.start_time_ms != 0 && other.start_time_ms < self.start_time_ms) {
            self.start_time_ms = other.start_time_ms;
        }
        self.last_access_time_ms = self.last_access_time_ms.max(other.last_access_time_ms);
        self.last_hit_time_ms = self.last_hit_time_ms.max(other.last_hit_time_ms);
        self.last_miss_time_ms = self.last_miss_time_ms.max(other.last_miss_time_ms);
    }
}
