//! # KuraKV Vector Index Primitives
//!
//! The flat top-K search in the store is a brute-force parallel scan; this
//! crate supplies its two building blocks:
//!
//! - `codec`: `[f32]` ⇄ raw little-endian byte strings, so vectors ride in
//!   ordinary cache values
//! - `simd`: squared-L2 and cosine over float slices, AVX2-accelerated with
//!   a scalar fallback
//!
//! There is deliberately no ANN structure here; the scan is exact.

pub mod codec;
pub mod simd;

pub use codec::{deserialize, dim_of, serialize};
pub use simd::{cosine, l2_sq, l2_sq_ref};
