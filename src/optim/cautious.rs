//! # Cautious Masking
//!
//! Suppresses update components that would move a parameter against its
//! current gradient. Callers pass a copy of their first-moment estimate; the
//! live buffer must keep its unmasked value for the next step's decay.

use crate::tensor::TensorData;
use ndarray::{Array, Dimension, Zip};

/// Lower bound on the mask mean, so an almost entirely masked update is not
/// blown up by the rescale.
const MIN_MASK_MEAN: TensorData = 1e-3;

/// Element-wise mask that is 1 where `update` and `grad` agree in sign and 0
/// elsewhere, rescaled so that its mean is 1.
pub fn cautious_mask<D: Dimension>(update: &Array<TensorData, D>, grad: &Array<TensorData, D>) -> Array<TensorData, D> {
    let mut mask = Array::<TensorData, D>::zeros(update.raw_dim());
    Zip::from(&mut mask)
        .and(update)
        .and(grad)
        .for_each(|m, &u, &g| *m = if u * g > 0.0 { 1.0 } else { 0.0 });
    let mean = mask.mean().unwrap_or(0.0).max(MIN_MASK_MEAN);
    mask.mapv_inplace(|m| m / mean);
    mask
}

/// Applies [`cautious_mask`] to `update`, consuming it.
pub fn cautious<D: Dimension>(mut update: Array<TensorData, D>, grad: &Array<TensorData, D>) -> Array<TensorData, D> {
    let mask = cautious_mask(&update, grad);
    Zip::from(&mut update).and(&mask).for_each(|u, &m| *u *= m);
    update
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn masked_elements_agree_with_gradient_or_vanish() {
        let update = arr1(&[1.0f32, -2.0, 3.0, 0.0]);
        let grad = arr1(&[0.5f32, 1.0, 2.0, 1.0]);
        let masked = cautious(update, &grad);

        // two of four survive, so the survivors are doubled
        assert_eq!(masked, arr1(&[2.0f32, 0.0, 6.0, 0.0]));
        for (&u, &g) in masked.iter().zip(grad.iter()) {
            assert!(u == 0.0 || u.signum() == g.signum());
        }
    }

    #[test]
    fn fully_masked_update_is_zero() {
        let masked = cautious(arr1(&[1.0f32, 1.0]), &arr1(&[-1.0f32, -1.0]));
        assert_eq!(masked, arr1(&[0.0f32, 0.0]));
    }

    #[test]
    fn caller_buffer_is_untouched() {
        let exp_avg = arr1(&[1.0f32, -1.0]);
        let grad = arr1(&[1.0f32, 1.0]);
        let _ = cautious(exp_avg.clone(), &grad);
        assert_eq!(exp_avg, arr1(&[1.0f32, -1.0]));
    }
}
