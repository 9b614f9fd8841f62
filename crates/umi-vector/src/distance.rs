//! Distance kernels for vector similarity.
//!
//! Two metrics, both oriented so that **lower means closer**:
//!
//! - **L2**: squared Euclidean distance, `sum((a[i] - b[i])^2)`. Never negative.
//! - **NegDot**: negated inner product, `-sum(a[i] * b[i])`, for maximum
//!   inner product search.
//!
//! Every kernel also has a **1x4 batched form** that scores one query against
//! four vectors in a single call. The batched forms keep four independent
//! accumulator streams so the compiler can vectorize them and the loads of the
//! four operands interleave; callers rely on the grouping to amortize reads
//! from memory-mapped records.
//!
//! Besides float slices, the kernels accept vectors stored as raw bytes at a
//! file-mapped offset ([`DistanceKind::distance_to_bytes`],
//! [`DistanceKind::distance4_bytes`]): native byte order, 4-byte aligned.
//! The byte-to-float reinterpretation lives here so index crates never touch
//! raw pointers to score a mapped record.
//!
//! All functions are designed to be auto-vectorized in release builds; the
//! 4-element chunking mirrors the preferred SIMD lane width.

/// Distance kind enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DistanceKind {
    /// Squared Euclidean (L2) distance: sum((a[i] - b[i])^2)
    L2,
    /// Negated dot product: -(a . b).
    /// Lower is better (more similar), so the inner product is negated.
    NegDot,
}

impl DistanceKind {
    /// Compute the distance between two vectors of equal length.
    ///
    /// Returns a value where lower = more similar. NaN inputs propagate.
    #[inline]
    pub fn distance(&self, a: &[f32], b: &[f32]) -> f32 {
        match self {
            Self::L2 => l2_distance(a, b),
            Self::NegDot => neg_dot_distance(a, b),
        }
    }

    /// Compute the distance from `query` to a vector stored as raw bytes in
    /// a mapped file region.
    ///
    /// `bytes` holds `query.len()` native-endian `f32`s and must be 4-byte
    /// aligned (mapped records guarantee this by construction).
    #[inline]
    pub fn distance_to_bytes(&self, query: &[f32], bytes: &[u8]) -> f32 {
        self.distance(query, float_region(bytes))
    }

    /// Compute four distances from one query to four vectors in one call.
    ///
    /// `out[i]` receives the distance from `query` to the i-th operand. The
    /// batched form produces bit-identical results to four single calls.
    #[inline]
    pub fn distance4(
        &self,
        query: &[f32],
        a: &[f32],
        b: &[f32],
        c: &[f32],
        d: &[f32],
        out: &mut [f32; 4],
    ) {
        match self {
            Self::L2 => l2_distance4(query, a, b, c, d, out),
            Self::NegDot => neg_dot_distance4(query, a, b, c, d, out),
        }
    }

    /// The 1x4 batched form over four byte regions of a mapped file, each
    /// holding `query.len()` native-endian `f32`s at 4-byte alignment.
    #[inline]
    pub fn distance4_bytes(
        &self,
        query: &[f32],
        a: &[u8],
        b: &[u8],
        c: &[u8],
        d: &[u8],
        out: &mut [f32; 4],
    ) {
        self.distance4(
            query,
            float_region(a),
            float_region(b),
            float_region(c),
            float_region(d),
            out,
        );
    }
}

/// Reinterpret a mapped byte region as native-endian `f32`s.
///
/// The region must be 4-byte aligned and a whole number of floats long.
#[inline]
fn float_region(bytes: &[u8]) -> &[f32] {
    debug_assert_eq!(bytes.len() % std::mem::size_of::<f32>(), 0);
    debug_assert_eq!(bytes.as_ptr() as usize % std::mem::align_of::<f32>(), 0);
    unsafe { std::slice::from_raw_parts(bytes.as_ptr() as *const f32, bytes.len() / 4) }
}

/// Squared Euclidean (L2) distance between two vectors.
///
/// The square root is deliberately omitted: nearest-neighbor search only
/// needs relative ordering, and the squared form is monotone in the true
/// distance.
///
/// # Example
///
/// ```
/// use umi_vector::l2_distance;
///
/// let a = [0.0, 0.0];
/// let b = [3.0, 4.0];
/// assert!((l2_distance(&a, &b) - 25.0).abs() < 1e-6);
/// ```
#[inline]
pub fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    // Process in chunks of 4 for better auto-vectorization
    let mut sum = 0.0f32;
    let chunks = a.len() / 4;

    for i in 0..chunks {
        let base = i * 4;
        let d0 = a[base] - b[base];
        let d1 = a[base + 1] - b[base + 1];
        let d2 = a[base + 2] - b[base + 2];
        let d3 = a[base + 3] - b[base + 3];
        sum += d0 * d0 + d1 * d1 + d2 * d2 + d3 * d3;
    }

    for i in (chunks * 4)..a.len() {
        let d = a[i] - b[i];
        sum += d * d;
    }

    sum
}

/// Negated dot product of two vectors: `-(a . b)`.
#[inline]
pub fn neg_dot_distance(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "Vector dimensions must match");

    let mut sum = 0.0f32;
    let chunks = a.len() / 4;

    for i in 0..chunks {
        let base = i * 4;
        sum += a[base] * b[base]
            + a[base + 1] * b[base + 1]
            + a[base + 2] * b[base + 2]
            + a[base + 3] * b[base + 3];
    }

    for i in (chunks * 4)..a.len() {
        sum += a[i] * b[i];
    }

    -sum
}

/// 1x4 batched squared Euclidean distance.
#[inline]
pub fn l2_distance4(q: &[f32], a: &[f32], b: &[f32], c: &[f32], d: &[f32], out: &mut [f32; 4]) {
    debug_assert!(a.len() == q.len() && b.len() == q.len() && c.len() == q.len() && d.len() == q.len());

    let mut s0 = 0.0f32;
    let mut s1 = 0.0f32;
    let mut s2 = 0.0f32;
    let mut s3 = 0.0f32;

    for i in 0..q.len() {
        let x = q[i];
        let d0 = x - a[i];
        let d1 = x - b[i];
        let d2 = x - c[i];
        let d3 = x - d[i];
        s0 += d0 * d0;
        s1 += d1 * d1;
        s2 += d2 * d2;
        s3 += d3 * d3;
    }

    *out = [s0, s1, s2, s3];
}

/// 1x4 batched negated dot product.
#[inline]
pub fn neg_dot_distance4(q: &[f32], a: &[f32], b: &[f32], c: &[f32], d: &[f32], out: &mut [f32; 4]) {
    debug_assert!(a.len() == q.len() && b.len() == q.len() && c.len() == q.len() && d.len() == q.len());

    let mut s0 = 0.0f32;
    let mut s1 = 0.0f32;
    let mut s2 = 0.0f32;
    let mut s3 = 0.0f32;

    for i in 0..q.len() {
        let x = q[i];
        s0 += x * a[i];
        s1 += x * b[i];
        s2 += x * c[i];
        s3 += x * d[i];
    }

    *out = [-s0, -s1, -s2, -s3];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_l2_distance() {
        let a = [0.0, 0.0, 0.0];
        let b = [3.0, 4.0, 0.0];
        assert!((l2_distance(&a, &b) - 25.0).abs() < 1e-6);

        // Same vectors = 0 distance
        let c = [1.0, 2.0, 3.0];
        assert!(l2_distance(&c, &c) < 1e-6);
    }

    #[test]
    fn test_l2_never_negative() {
        let a = [-1.5, 2.5, -3.5, 4.5, 0.25];
        let b = [4.0, -3.0, 2.0, -1.0, 7.75];
        assert!(l2_distance(&a, &b) >= 0.0);
    }

    #[test]
    fn test_neg_dot_distance() {
        let a = [1.0, 2.0, 3.0];
        let b = [4.0, 5.0, 6.0];
        // 1*4 + 2*5 + 3*6 = 32, negated
        assert!((neg_dot_distance(&a, &b) + 32.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_kind_dispatch() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];

        let d = DistanceKind::L2.distance(&a, &b);
        assert!((d - 2.0).abs() < 1e-6);

        // Orthogonal vectors: dot product is 0
        let d = DistanceKind::NegDot.distance(&a, &b);
        assert!(d.abs() < 1e-6);
    }

    #[test]
    fn test_batched_matches_single() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(7);

        let dim = 37; // not a multiple of 4, exercises the tail loop
        let q: Vec<f32> = (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect();
        let vs: Vec<Vec<f32>> = (0..4)
            .map(|_| (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect())
            .collect();

        for kind in [DistanceKind::L2, DistanceKind::NegDot] {
            let mut out = [0.0f32; 4];
            kind.distance4(&q, &vs[0], &vs[1], &vs[2], &vs[3], &mut out);
            for i in 0..4 {
                let single = kind.distance(&q, &vs[i]);
                assert!(
                    (out[i] - single).abs() < 1e-4,
                    "lane {i}: batched {} vs single {single}",
                    out[i]
                );
            }
        }
    }

    #[test]
    fn test_byte_region_matches_slice() {
        let q = [1.0f32, -2.0, 3.5, 0.25, 4.0];
        let v = [0.5f32, 2.0, -1.5, 8.0, -0.75];
        // f32 storage is always 4-byte aligned, so viewing it as bytes
        // models a mapped record.
        let bytes = unsafe {
            std::slice::from_raw_parts(v.as_ptr() as *const u8, std::mem::size_of_val(&v))
        };

        for kind in [DistanceKind::L2, DistanceKind::NegDot] {
            assert_eq!(kind.distance_to_bytes(&q, bytes), kind.distance(&q, &v));
        }
    }

    #[test]
    fn test_batched_byte_region_matches_slice() {
        let q = [1.0f32, 2.0, 3.0, 4.0];
        let vs = [
            [0.1f32, 0.2, 0.3, 0.4],
            [4.0, 3.0, 2.0, 1.0],
            [-1.0, -2.0, -3.0, -4.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        let bytes: Vec<&[u8]> = vs
            .iter()
            .map(|v| unsafe {
                std::slice::from_raw_parts(v.as_ptr() as *const u8, std::mem::size_of_val(v))
            })
            .collect();

        for kind in [DistanceKind::L2, DistanceKind::NegDot] {
            let mut from_bytes = [0.0f32; 4];
            kind.distance4_bytes(&q, bytes[0], bytes[1], bytes[2], bytes[3], &mut from_bytes);
            let mut from_slices = [0.0f32; 4];
            kind.distance4(&q, &vs[0], &vs[1], &vs[2], &vs[3], &mut from_slices);
            assert_eq!(from_bytes, from_slices);
        }
    }

    #[test]
    fn test_nan_propagates() {
        let a = [f32::NAN, 1.0];
        let b = [0.0, 1.0];
        assert!(l2_distance(&a, &b).is_nan());
        assert!(neg_dot_distance(&a, &b).is_nan());
    }
}
