//! # KuraKV Storage Engine
//!
//! In-process key–value cache with optional durability, periodic
//! expiration, and a flat vector-similarity scan.
//!
//! ## Write path
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  put(key, value, ttl)                                       │
//! │     │ consistency lock (shared)                             │
//! │     ▼                                                       │
//! │  shard[hash(key) % N]  ──── update LRU+TTL map              │
//! │     │ shard lock released                                   │
//! │     ▼                                                       │
//! │  WAL append (buffered) ──── background fsync thread         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Housekeeping
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  expiration thread: try-lock shard → sample → drop expired  │
//! │  checkpoint thread: export + snapshot + truncate WAL        │
//! │                     (exclusive consistency lock)            │
//! │  fsync thread:      flush WAL buffer every interval         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Recovery replays the newest snapshot, then the WAL tail whose record
//! LSNs lie past the snapshot's header LSN.

pub mod append_file;
pub mod checkpoint;
pub mod expiration;
pub mod group_commit;
pub mod shard;
pub mod snapshot;
pub mod store;
pub mod wal;

pub use append_file::AppendFile;
pub use checkpoint::{CheckpointManager, CheckpointStats};
pub use expiration::{ExpirationManager, ExpirationStats};
pub use group_commit::{GroupCommit, GroupCommitConfig, GroupCommitStats};
pub use shard::CacheShard;
pub use store::{HealthStatus, ReplayOutcome, SearchHit, ShardedStore};
pub use wal::{LogRecord, WalConfig, WalOp, WriteAheadLog};
