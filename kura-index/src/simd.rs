//! # SIMD Distance Kernels
//!
//! Squared-L2 and cosine over two float slices, the inner loop of the flat
//! top-K scan.
//!
//! ## Implementation strategy
//! 1. Detect CPU features at runtime
//! 2. Dispatch: AVX2+FMA 8-wide loop with scalar tail, else scalar reference
//!
//! Values stored in cache entries carry no alignment guarantee, so the
//! vectorised paths use unaligned loads exclusively.

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

/// Scalar reference for squared Euclidean distance. Baseline for benchmarks
/// and the portability fallback.
#[inline]
pub fn l2_sq_ref(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Squared Euclidean distance, dispatched to the fastest available kernel.
#[inline]
pub fn l2_sq(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return unsafe { l2_sq_avx2_fma(a, b) };
        }
    }

    l2_sq_ref(a, b)
}

/// Cosine similarity in a single pass over both slices: three accumulators
/// (dot product and both squared norms) advance together. Returns 0 when
/// either norm is degenerate.
#[inline]
pub fn cosine(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());

    #[cfg(target_arch = "x86_64")]
    {
        if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
            return unsafe { cosine_avx2_fma(a, b) };
        }
    }

    cosine_scalar(a, b)
}

#[inline]
fn cosine_scalar(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = (norm_a * norm_b).sqrt();
    if denom < 1e-8 {
        0.0
    } else {
        dot / denom
    }
}

// ============================================================================
// AVX2 + FMA kernels (256-bit, 8 floats per iteration)
// ============================================================================

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn l2_sq_avx2_fma(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len();
    let chunks = n / 8;
    let remainder = n % 8;

    let mut sum = _mm256_setzero_ps();

    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    for i in 0..chunks {
        let offset = i * 8;
        let va = _mm256_loadu_ps(a_ptr.add(offset));
        let vb = _mm256_loadu_ps(b_ptr.add(offset));
        let diff = _mm256_sub_ps(va, vb);
        sum = _mm256_fmadd_ps(diff, diff, sum);
    }

    let mut result = hsum256_ps(sum);

    let base = chunks * 8;
    for i in 0..remainder {
        let d = a[base + i] - b[base + i];
        result += d * d;
    }

    result
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2", enable = "fma")]
unsafe fn cosine_avx2_fma(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len();
    let chunks = n / 8;
    let remainder = n % 8;

    let mut dot_sum = _mm256_setzero_ps();
    let mut norm_a_sum = _mm256_setzero_ps();
    let mut norm_b_sum = _mm256_setzero_ps();

    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    for i in 0..chunks {
        let offset = i * 8;
        let va = _mm256_loadu_ps(a_ptr.add(offset));
        let vb = _mm256_loadu_ps(b_ptr.add(offset));

        dot_sum = _mm256_fmadd_ps(va, vb, dot_sum);
        norm_a_sum = _mm256_fmadd_ps(va, va, norm_a_sum);
        norm_b_sum = _mm256_fmadd_ps(vb, vb, norm_b_sum);
    }

    let mut dot = hsum256_ps(dot_sum);
    let mut norm_a = hsum256_ps(norm_a_sum);
    let mut norm_b = hsum256_ps(norm_b_sum);

    let base = chunks * 8;
    for i in 0..remainder {
        let x = a[base + i];
        let y = b[base + i];
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = (norm_a * norm_b).sqrt();
    if denom < 1e-8 {
        0.0
    } else {
        dot / denom
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx")]
#[inline]
unsafe fn hsum256_ps(v: __m256) -> f32 {
    // Fold the high lane onto the low lane, then horizontal-sum 4 floats.
    let high = _mm256_extractf128_ps(v, 1);
    let low = _mm256_castps256_ps128(v);
    let sum128 = _mm_add_ps(high, low);

    let shuf = _mm_movehdup_ps(sum128);
    let sums = _mm_add_ps(sum128, shuf);
    let shuf = _mm_movehl_ps(sums, sums);
    let sums = _mm_add_ss(sums, shuf);
    _mm_cvtss_f32(sums)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo_vec(seed: u64, dim: usize) -> Vec<f32> {
        // xorshift-based deterministic data; no RNG state shared with other tests
        let mut x = seed.wrapping_mul(0x9E3779B97F4A7C15) | 1;
        (0..dim)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                (x as f32 / u64::MAX as f32) * 2.0 - 1.0
            })
            .collect()
    }

    #[test]
    fn l2_matches_hand_computed() {
        let a = [1.0f32, 2.0, 3.0];
        let b = [4.0f32, 6.0, 3.0];
        assert_eq!(l2_sq_ref(&a, &b), 9.0 + 16.0);
        assert_eq!(l2_sq(&a, &b), 25.0);
    }

    #[test]
    fn simd_agrees_with_reference() {
        // Cover a sweep of dimensions including non-multiples of 8 and
        // large embedding sizes.
        for dim in [1, 7, 8, 9, 15, 16, 127, 128, 768, 1024, 4096] {
            let a = pseudo_vec(dim as u64 + 1, dim);
            let b = pseudo_vec(dim as u64 + 1000, dim);

            let reference = l2_sq_ref(&a, &b);
            let fast = l2_sq(&a, &b);

            let tolerance = 1e-3 * reference.abs().max(1e-6);
            assert!(
                (reference - fast).abs() <= tolerance,
                "dim {}: ref {} vs simd {}",
                dim,
                reference,
                fast
            );
        }
    }

    #[test]
    fn l2_of_identical_vectors_is_zero() {
        let a = pseudo_vec(7, 768);
        assert_eq!(l2_sq_ref(&a, &a), 0.0);
        assert_eq!(l2_sq(&a, &a), 0.0);
    }

    #[test]
    fn cosine_of_parallel_vectors_is_one() {
        let a = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0];
        let b: Vec<f32> = a.iter().map(|x| x * 2.5).collect();
        let sim = cosine(&a, &b);
        assert!((sim - 1.0).abs() < 1e-5, "got {}", sim);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        let a = [1.0f32, 0.0, 0.0, 0.0];
        let b = [0.0f32, 1.0, 0.0, 0.0];
        assert!(cosine(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn cosine_degenerate_norm_returns_zero() {
        let zero = [0.0f32; 16];
        let other = pseudo_vec(3, 16);
        assert_eq!(cosine(&zero, &other), 0.0);
        assert_eq!(cosine(&zero, &zero), 0.0);
    }

    #[test]
    fn kernels_accept_unaligned_slices() {
        // Slicing at odd offsets defeats any accidental alignment.
        let a = pseudo_vec(11, 130);
        let b = pseudo_vec(13, 130);
        let (a, b) = (&a[1..129], &b[1..129]);

        let reference = l2_sq_ref(a, b);
        let fast = l2_sq(a, b);
        assert!((reference - fast).abs() <= 1e-3 * reference.max(1e-6));
    }
}
