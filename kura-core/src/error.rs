//! # Error Handling
//!
//! Error types for KuraKV operations.
//!
//! Leaf errors bubble up from the append file through the WAL to the store
//! and checkpoint manager. Foreground operations catch them, update shard
//! health counters, and return the best available result; background threads
//! log and continue.

use thiserror::Error;

/// Result type alias for KuraKV operations
pub type Result<T> = std::result::Result<T, Error>;

/// Primary error type for KuraKV
#[derive(Error, Debug)]
pub enum Error {
    /// I/O failure in the append file, WAL, or snapshot handling.
    #[error("I/O error during {op}: {source}")]
    Io {
        op: &'static str,
        source: std::io::Error,
    },

    /// Snapshot file failed validation: bad magic, unsupported version,
    /// checksum mismatch, or truncated body. Recovery aborts without
    /// loading partial data.
    #[error("corrupt snapshot: {reason}")]
    CorruptSnapshot { reason: String },

    /// A key or value could not be canonicalised for the persistence path.
    #[error("serialization failed for {type_name}: {detail}")]
    Serialization {
        type_name: &'static str,
        detail: String,
    },

    /// Internal sentinel: the target shard has been disabled by the health
    /// checker. Callers translate this to benign defaults.
    #[error("shard is disabled")]
    ShardDisabled,

    /// Key or value longer than a u32 length prefix can frame.
    #[error("{what} too large for WAL framing: {len} bytes")]
    OversizedRecord { what: &'static str, len: usize },

    /// WAL used after `clear_all` failed to reopen it, or after shutdown.
    #[error("write-ahead log is closed")]
    WalClosed,

    #[error("configuration error: {message}")]
    Configuration { message: String },

    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Wrap an `std::io::Error` with the operation that produced it.
    pub fn io(op: &'static str, source: std::io::Error) -> Self {
        Error::Io { op, source }
    }

    pub fn corrupt(reason: impl Into<String>) -> Self {
        Error::CorruptSnapshot {
            reason: reason.into(),
        }
    }

    /// Whether retrying the operation can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Io { .. } => false,
            Error::CorruptSnapshot { .. } => false,
            Error::OversizedRecord { .. } => false,
            Error::ShardDisabled => true,
            _ => true,
        }
    }

    /// Stable code for monitoring and log aggregation.
    pub fn error_code(&self) -> &'static str {
        match self {
            Error::Io { .. } => "IO_ERROR",
            Error::CorruptSnapshot { .. } => "CORRUPT_SNAPSHOT",
            Error::Serialization { .. } => "SERIALIZATION_ERROR",
            Error::ShardDisabled => "SHARD_DISABLED",
            Error::OversizedRecord { .. } => "OVERSIZED_RECORD",
            Error::WalClosed => "WAL_CLOSED",
            Error::Configuration { .. } => "CONFIG_ERROR",
            Error::Internal { .. } => "INTERNAL_ERROR",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        let e = Error::io("append", std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(e.error_code(), "IO_ERROR");
        assert!(!e.is_recoverable());

        let e = Error::corrupt("bad magic");
        assert_eq!(e.error_code(), "CORRUPT_SNAPSHOT");

        let e = Error::OversizedRecord {
            what: "key",
            len: usize::MAX,
        };
        assert_eq!(e.error_code(), "OVERSIZED_RECORD");
        assert!(e.to_string().contains("key"));
    }
}
