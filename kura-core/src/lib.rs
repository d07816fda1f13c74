//! # KuraKV Core
//!
//! Shared building blocks for the KuraKV engine:
//! - Error types
//! - Configuration structures
//! - Cache statistics
//! - Key canonicalisation for the persistence layer
//! - Time utilities
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │                   kura-core                     │
//! ├─────────────────────────────────────────────────┤
//! │  • error     - Error handling                   │
//! │  • config    - Engine configuration             │
//! │  • stats     - Cache counters & derived ratios  │
//! │  • codec     - Key canonicalisation             │
//! │  • time      - Millisecond clock                │
//! └─────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod stats;
pub mod time;

pub use codec::CacheKey;
pub use config::{CheckpointConfig, ExpirationConfig, PersistenceConfig, StoreConfig};
pub use error::{Error, Result};
pub use stats::CacheStats;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Snapshot file format version written by this build.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;
