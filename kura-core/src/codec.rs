//! # Key Canonicalisation
//!
//! The WAL and snapshot files store keys as byte strings. `CacheKey` is the
//! compile-time bridge between the store's generic key type and that
//! canonical encoding: integers serialise as decimal ASCII, strings and raw
//! bytes pass through unchanged. A key type without an impl fails the build
//! rather than failing silently at runtime.

use std::hash::Hash;

use bytes::Bytes;

use crate::error::{Error, Result};

/// Key types the persistence layer can canonicalise.
pub trait CacheKey: Hash + Eq + Clone + Send + Sync + 'static {
    /// Short type name used in serialization error reports.
    const TYPE_NAME: &'static str;

    /// Canonical byte encoding written to the WAL and snapshots.
    fn encode(&self) -> Bytes;

    /// Inverse of [`encode`](CacheKey::encode); used during recovery.
    fn decode(raw: &[u8]) -> Result<Self>;
}

impl CacheKey for String {
    const TYPE_NAME: &'static str = "String";

    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        String::from_utf8(raw.to_vec()).map_err(|e| Error::Serialization {
            type_name: Self::TYPE_NAME,
            detail: e.to_string(),
        })
    }
}

impl CacheKey for Vec<u8> {
    const TYPE_NAME: &'static str = "Vec<u8>";

    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(self)
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        Ok(raw.to_vec())
    }
}

impl CacheKey for Bytes {
    const TYPE_NAME: &'static str = "Bytes";

    fn encode(&self) -> Bytes {
        self.clone()
    }

    fn decode(raw: &[u8]) -> Result<Self> {
        Ok(Bytes::copy_from_slice(raw))
    }
}

macro_rules! integer_key {
    ($($ty:ty),*) => {
        $(
            impl CacheKey for $ty {
                const TYPE_NAME: &'static str = stringify!($ty);

                fn encode(&self) -> Bytes {
                    Bytes::from(self.to_string().into_bytes())
                }

                fn decode(raw: &[u8]) -> Result<Self> {
                    let text = std::str::from_utf8(raw).map_err(|e| Error::Serialization {
                        type_name: Self::TYPE_NAME,
                        detail: e.to_string(),
                    })?;
                    text.parse::<$ty>().map_err(|e| Error::Serialization {
                        type_name: Self::TYPE_NAME,
                        detail: e.to_string(),
                    })
                }
            }
        )*
    };
}

integer_key!(i32, i64, u32, u64);
