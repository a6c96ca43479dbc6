//! # Tensor Operations
//!
//! Reductions and flat views over raw `ndarray` buffers. Reductions
//! accumulate in `f64` regardless of the storage type.

use super::{TensorData, TensorError};
use ndarray::{Array, ArrayD, ArrayViewMut1, Dimension, Ix1};

/// Inner product of two equally shaped buffers.
pub fn dot<D: Dimension>(a: &Array<TensorData, D>, b: &Array<TensorData, D>) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(&x, &y)| x as f64 * y as f64)
        .sum()
}

/// Euclidean norm.
pub fn norm<D: Dimension>(a: &Array<TensorData, D>) -> f64 {
    dot(a, a).sqrt()
}

/// Unbiased standard deviation (n - 1 denominator). Buffers with fewer than
/// two elements have no spread and report 0.
pub fn std<D: Dimension>(a: &Array<TensorData, D>) -> f64 {
    let n = a.len();
    if n < 2 {
        return 0.0;
    }
    let mean = a.iter().map(|&x| x as f64).sum::<f64>() / n as f64;
    let var = a
        .iter()
        .map(|&x| {
            let d = x as f64 - mean;
            d * d
        })
        .sum::<f64>()
        / (n - 1) as f64;
    var.sqrt()
}

/// Cosine similarity, or 0 when either buffer has zero norm.
pub fn cosine_similarity<D: Dimension>(a: &Array<TensorData, D>, b: &Array<TensorData, D>) -> f64 {
    let denom = norm(a) * norm(b);
    if denom == 0.0 {
        0.0
    } else {
        dot(a, b) / denom
    }
}

/// `true` when every element is finite.
pub fn all_finite<D: Dimension>(a: &Array<TensorData, D>) -> bool {
    a.iter().all(|v| v.is_finite())
}

/// Row-major flat mutable view of a standard-layout buffer.
pub fn flat_mut(a: &mut ArrayD<TensorData>) -> Result<ArrayViewMut1<'_, TensorData>, TensorError> {
    let len = a.len();
    Ok(a.view_mut().into_shape(Ix1(len))?)
}

/// Row-major copy of a buffer as a 1-D array.
pub fn flatten<D: Dimension>(a: &Array<TensorData, D>) -> Array<TensorData, Ix1> {
    a.iter().copied().collect()
}

/// Selects the elements at the given row-major positions.
pub fn gather<D: Dimension>(a: &Array<TensorData, D>, indices: &[usize]) -> Array<TensorData, Ix1> {
    let flat = flatten(a);
    indices.iter().map(|&i| flat[i]).collect()
}
