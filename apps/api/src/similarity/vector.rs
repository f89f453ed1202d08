//! Vector math: cosine similarity, centroids and redundancy checks.

/// Cosine similarity in `[-1.0, 1.0]`.
///
/// Returns `0.0` for empty vectors, vectors of different lengths, or zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

/// Arithmetic mean of `vectors`. The result is NOT renormalised to unit length.
///
/// The dimension is taken from the first vector; vectors of any other length are
/// ignored. Returns `None` when there is nothing to average.
pub fn centroid(vectors: &[&[f32]]) -> Option<Vec<f32>> {
    let dims = vectors.first()?.len();
    if dims == 0 {
        return None;
    }

    // Accumulate in f64 so the mean does not depend on summation drift.
    let mut sum = vec![0.0f64; dims];
    let mut count = 0usize;
    for vector in vectors.iter().filter(|v| v.len() == dims) {
        for (acc, &x) in sum.iter_mut().zip(vector.iter()) {
            *acc += x as f64;
        }
        count += 1;
    }

    Some(sum.into_iter().map(|s| (s / count as f64) as f32).collect())
}

/// Highest cosine similarity between `candidate` and any of `selected`.
pub fn max_similarity(candidate: &[f32], selected: &[&[f32]]) -> f32 {
    selected
        .iter()
        .map(|s| cosine_similarity(candidate, s))
        .fold(f32::NEG_INFINITY, f32::max)
}

/// MMR-style redundancy test: true when `candidate` is at least `threshold` similar
/// to something already selected.
pub fn is_redundant(candidate: &[f32], selected: &[&[f32]], threshold: f32) -> bool {
    !selected.is_empty() && max_similarity(candidate, selected) >= threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_mismatched_lengths_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_centroid_is_exact_mean_without_renormalising() {
        let a = [1.0f32, 0.0, 4.0];
        let b = [3.0f32, 2.0, 0.0];
        let c = centroid(&[&a, &b]).unwrap();
        assert_eq!(c, vec![2.0, 1.0, 2.0]);
        let norm: f32 = c.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() > 0.1, "centroid must not be unit-normalised");
    }

    #[test]
    fn test_centroid_is_idempotent() {
        let a = [0.1f32, 0.7, -0.3];
        let b = [0.9f32, -0.2, 0.4];
        let c = [0.33f32, 0.33, 0.33];
        let first = centroid(&[&a, &b, &c]).unwrap();
        let second = centroid(&[&a, &b, &c]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_centroid_skips_foreign_dimensions() {
        let a = [2.0f32, 2.0];
        let odd = [9.0f32, 9.0, 9.0];
        let b = [4.0f32, 0.0];
        assert_eq!(centroid(&[&a, &odd, &b]).unwrap(), vec![3.0, 1.0]);
    }

    #[test]
    fn test_centroid_empty_is_none() {
        assert!(centroid(&[]).is_none());
    }

    #[test]
    fn test_is_redundant_threshold() {
        let selected = [1.0f32, 0.0];
        let near = [0.99f32, 0.05];
        let far = [0.0f32, 1.0];
        assert!(is_redundant(&near, &[&selected], 0.95));
        assert!(!is_redundant(&far, &[&selected], 0.95));
        assert!(!is_redundant(&near, &[], 0.95));
    }
}
