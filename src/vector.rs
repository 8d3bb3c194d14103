//! Small dense-vector helpers shared by the embedding, projection and
//! similarity code. Generic over the float width so the same routines serve
//! the `f64` query path and the `f32` persisted broad matrix.
use num_traits::Float;

#[inline]
pub fn dot<T: Float>(a: &[T], b: &[T]) -> T {
    a.iter()
        .zip(b.iter())
        .fold(T::zero(), |acc, (x, y)| acc + *x * *y)
}

#[inline]
pub fn l2_norm<T: Float>(a: &[T]) -> T {
    dot(a, a).sqrt()
}

/// Scale `values` to unit length in place. A vector that is exactly zero is
/// left untouched, so the caller can tell "no signal" apart from a direction.
pub fn normalize_in_place<T: Float>(values: &mut [T]) -> T {
    let norm = l2_norm(values);
    if norm > T::zero() {
        values.iter_mut().for_each(|v| *v = *v / norm);
    }
    norm
}

/// Normalize every `dim`-wide row of a row-major matrix.
pub fn normalize_rows<T: Float + Send + Sync>(matrix: &mut [T], dim: usize) {
    use rayon::prelude::*;
    if dim == 0 {
        return;
    }
    matrix.par_chunks_mut(dim).for_each(|row| {
        normalize_in_place(row);
    });
}

/// Cosine distance for vectors that are either unit length or all zero.
/// A zero vector is treated as orthogonal to everything, matching the
/// convention used by scikit-learn's `cosine_distances`.
#[inline]
pub fn unit_cosine_distance(a: &[f64], b: &[f64]) -> f64 {
    (1.0 - dot(a, b)).clamp(0.0, 2.0)
}

/// Linear-interpolated percentile of `values`, `q` in `[0, 100]`.
pub fn percentile(values: &[f64], q: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (q / 100.0).clamp(0.0, 1.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}
