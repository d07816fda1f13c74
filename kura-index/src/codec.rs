//! Vector ⇄ byte-string codec.
//!
//! Vectors are stored as the raw little-endian bytes of their `f32`
//! components; the dimension is implied by `len / 4`. Deployments are
//! assumed endianness-consistent, so the native layout on little-endian
//! targets is also the wire layout.

use bytes::Bytes;

/// Serialize a float slice into its raw byte representation.
pub fn serialize(vec: &[f32]) -> Bytes {
    let mut out = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        out.extend_from_slice(&v.to_le_bytes());
    }
    Bytes::from(out)
}

/// Dimension implied by a raw value, or `None` when the length is not a
/// multiple of 4 (such values are skipped by the search).
#[inline]
pub fn dim_of(raw: &[u8]) -> Option<usize> {
    if raw.len() % 4 == 0 {
        Some(raw.len() / 4)
    } else {
        None
    }
}

/// Copy a raw byte string back into a float vector. Returns an empty vector
/// when the length is not a multiple of 4.
pub fn deserialize(raw: &[u8]) -> Vec<f32> {
    let Some(dim) = dim_of(raw) else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(dim);
    for chunk in raw.chunks_exact(4) {
        out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
    }
    out
}
