//! Vector math exposed to oracles through the host ABI.
//!
//! All functions expect equal-length slices; callers check dimensions.

/// Unrolled by 8 so LLVM can keep two AVX2 registers (or one AVX-512) busy.
#[inline(always)]
pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = 0.0;

    let chunks = a.chunks_exact(8);
    let b_chunks = b.chunks_exact(8);
    let remainder_start = a.len() - a.len() % 8;

    for (ac, bc) in chunks.zip(b_chunks) {
        sum += ac[0]*bc[0] + ac[1]*bc[1] + ac[2]*bc[2] + ac[3]*bc[3] +
        ac[4]*bc[4] + ac[5]*bc[5] + ac[6]*bc[6] + ac[7]*bc[7];
    }

    for i in remainder_start..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

#[inline]
pub fn magnitude(a: &[f64]) -> f64 {
    dot(a, a).sqrt()
}

/// Cosine similarity in [-1, 1]; 0 when either vector has zero length.
pub fn cosine(a: &[f64], b: &[f64]) -> f64 {
    let den = magnitude(a) * magnitude(b);
    if den == 0.0 {
        return 0.0;
    }
    dot(a, b) / den
}

/// Euclidean distance.
pub fn distance(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = 0.0;

    let chunks = a.chunks_exact(8);
    let b_chunks = b.chunks_exact(8);
    let remainder_start = a.len() - a.len() % 8;

    for (ac, bc) in chunks.zip(b_chunks) {
        let d0 = ac[0] - bc[0];
        let d1 = ac[1] - bc[1];
        let d2 = ac[2] - bc[2];
        let d3 = ac[3] - bc[3];
        let d4 = ac[4] - bc[4];
        let d5 = ac[5] - bc[5];
        let d6 = ac[6] - bc[6];
        let d7 = ac[7] - bc[7];

        sum += d0*d0 + d1*d1 + d2*d2 + d3*d3 +
        d4*d4 + d5*d5 + d6*d6 + d7*d7;
    }

    for i in remainder_start..a.len() {
        let diff = a[i] - b[i];
        sum += diff * diff;
    }
    sum.sqrt()
}

/// Jaccard similarity for binary (0/1) vectors.
pub fn jaccard(a: &[f64], b: &[f64]) -> f64 {
    let mut m11 = 0.0;
    let mut m10 = 0.0;

    for (va, vb) in a.iter().zip(b) {
        m11 += va * vb;
        if va + vb == 1.0 {
            m10 += 1.0;
        }
    }

    if m11 + m10 == 0.0 {
        return 0.0;
    }
    m11 / (m11 + m10)
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-12;

    #[test]
    fn dot_covers_remainder_lanes() {
        let a: Vec<f64> = (1..=11).map(|x| x as f64).collect();
        let expected: f64 = a.iter().map(|x| x * x).sum();
        assert!((dot(&a, &a) - expected).abs() < EPS);
    }

    #[test]
    fn cosine_of_near_parallel_vectors() {
        let sim = cosine(&[1.0, 0.0], &[0.99, 0.1]);
        assert!(sim > 0.99 && sim < 1.0);
        assert!(cosine(&[1.0, 0.0], &[0.0, 1.0]).abs() < EPS);
        assert_eq!(cosine(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }

    #[test]
    fn distance_matches_pythagoras() {
        assert!((distance(&[0.0, 0.0], &[3.0, 4.0]) - 5.0).abs() < EPS);
        let a = vec![1.0; 16];
        let b = vec![0.0; 16];
        assert!((distance(&a, &b) - 4.0).abs() < EPS);
    }

    #[test]
    fn jaccard_binary() {
        assert!((jaccard(&[1.0, 1.0, 0.0], &[1.0, 0.0, 1.0]) - 1.0 / 3.0).abs() < EPS);
        assert_eq!(jaccard(&[0.0, 0.0], &[0.0, 0.0]), 0.0);
    }
}
