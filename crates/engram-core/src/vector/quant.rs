//! Scalar Quantization (f32 -> int8)
//!
//! Per-vector linear quantization into [-127, 127] with a stored
//! scale/offset pair, and cosine similarity computed directly on the
//! quantized bytes with i32 accumulators.

use super::{Result, VectorError};

/// Quantize an f32 vector to int8 with per-vector scale and offset.
///
/// Maps [min, max] linearly onto [-127, 127]:
/// `scale = (max - min) / 254`, `offset = (max + min) / 2`.
///
/// A zero vector (or any constant vector) quantizes to all-zero bytes
/// with `scale = 1.0` so dequantization stays exact.
pub fn quantize_int8(v: &[f32]) -> Result<(Vec<i8>, f32, f32)> {
    if v.is_empty() {
        return Err(VectorError::Empty);
    }

    let mut min = f32::INFINITY;
    let mut max = f32::NEG_INFINITY;
    for &x in v {
        if x < min {
            min = x;
        }
        if x > max {
            max = x;
        }
    }

    let range = max - min;
    if !range.is_finite() || range < f32::EPSILON {
        // Constant vector: every dimension equals the offset exactly.
        let offset = if min == 0.0 { 0.0 } else { (max + min) / 2.0 };
        return Ok((vec![0i8; v.len()], 1.0, offset));
    }

    let scale = range / 254.0;
    let offset = (max + min) / 2.0;

    let bytes = v
        .iter()
        .map(|&x| {
            let q = ((x - offset) / scale).round();
            q.clamp(-127.0, 127.0) as i8
        })
        .collect();

    Ok((bytes, scale, offset))
}

/// Exact inverse of [`quantize_int8`], used by fallback paths.
pub fn dequantize_int8(bytes: &[i8], scale: f32, offset: f32) -> Vec<f32> {
    bytes.iter().map(|&b| b as f32 * scale + offset).collect()
}

/// Cosine similarity over int8 vectors.
///
/// Dot product and norms accumulate in i32 (127^2 * dim stays well under
/// i32::MAX for any realistic embedding width). Returns 0.0 when either
/// norm is zero.
pub fn cosine_int8(a: &[i8], b: &[i8]) -> Result<f32> {
    if a.is_empty() || b.is_empty() {
        return Err(VectorError::Empty);
    }
    if a.len() != b.len() {
        return Err(VectorError::DimMismatch(a.len(), b.len()));
    }

    let mut dot: i32 = 0;
    let mut norm_a: i32 = 0;
    let mut norm_b: i32 = 0;
    for (&x, &y) in a.iter().zip(b.iter()) {
        let (x, y) = (x as i32, y as i32);
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0 || norm_b == 0 {
        return Ok(0.0);
    }

    Ok((dot as f64 / ((norm_a as f64).sqrt() * (norm_b as f64).sqrt())) as f32)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic pseudo-random vector in [-1, 1]
    fn pseudo_random_vector(seed: u64, dim: usize) -> Vec<f32> {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (0..dim)
            .map(|_| {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                ((state >> 33) as f32 / (u32::MAX >> 1) as f32) - 1.0
            })
            .collect()
    }

    fn unit_norm(v: &mut [f32]) {
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
    }

    fn cosine_f32(a: &[f32], b: &[f32]) -> f32 {
        let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
        let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
        if na == 0.0 || nb == 0.0 {
            return 0.0;
        }
        dot / (na * nb)
    }

    #[test]
    fn test_quantize_empty() {
        assert_eq!(quantize_int8(&[]), Err(VectorError::Empty));
    }

    #[test]
    fn test_zero_vector_policy() {
        let (bytes, scale, offset) = quantize_int8(&[0.0; 64]).unwrap();
        assert!(bytes.iter().all(|&b| b == 0));
        assert_eq!(scale, 1.0);
        assert_eq!(offset, 0.0);
    }

    #[test]
    fn test_constant_vector_roundtrips() {
        let v = vec![0.37f32; 32];
        let (bytes, scale, offset) = quantize_int8(&v).unwrap();
        let back = dequantize_int8(&bytes, scale, offset);
        for x in back {
            assert!((x - 0.37).abs() < 1e-6);
        }
    }

    #[test]
    fn test_extremes_map_to_bounds() {
        let v = vec![-1.0f32, 0.0, 1.0];
        let (bytes, _, _) = quantize_int8(&v).unwrap();
        assert_eq!(bytes[0], -127);
        assert_eq!(bytes[1], 0);
        assert_eq!(bytes[2], 127);
    }

    #[test]
    fn test_roundtrip_cosine_preserved() {
        // dequantize(quantize(v)) must stay within cosine 0.98 of v
        // for unit-norm vectors at realistic dimensions.
        for seed in 1..=20u64 {
            let mut v = pseudo_random_vector(seed, 256);
            unit_norm(&mut v);
            let (bytes, scale, offset) = quantize_int8(&v).unwrap();
            let back = dequantize_int8(&bytes, scale, offset);
            assert!(
                cosine_f32(&v, &back) >= 0.98,
                "round-trip cosine degraded for seed {}",
                seed
            );
        }
    }

    #[test]
    fn test_cosine_int8_self_similarity() {
        let mut v = pseudo_random_vector(7, 128);
        unit_norm(&mut v);
        let (bytes, _, _) = quantize_int8(&v).unwrap();
        let sim = cosine_int8(&bytes, &bytes).unwrap();
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_int8_tracks_f32() {
        let mut a = pseudo_random_vector(11, 256);
        let mut b = pseudo_random_vector(12, 256);
        unit_norm(&mut a);
        unit_norm(&mut b);
        let (qa, _, _) = quantize_int8(&a).unwrap();
        let (qb, _, _) = quantize_int8(&b).unwrap();
        let approx = cosine_int8(&qa, &qb).unwrap();
        let exact = cosine_f32(&a, &b);
        assert!((approx - exact).abs() < 0.05);
    }

    #[test]
    fn test_cosine_int8_zero_norm() {
        let zero = vec![0i8; 16];
        let other = vec![1i8; 16];
        assert_eq!(cosine_int8(&zero, &other).unwrap(), 0.0);
    }

    #[test]
    fn test_cosine_int8_dim_mismatch() {
        let a = vec![1i8; 8];
        let b = vec![1i8; 9];
        assert_eq!(cosine_int8(&a, &b), Err(VectorError::DimMismatch(8, 9)));
    }
}
