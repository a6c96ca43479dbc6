//! # Functional Helpers
//!
//! Building blocks shared by several update rules.

use crate::tensor::TensorData;
use ndarray::{ArrayD, Zip};

/// Applies weight decay either to the parameter (decoupled, AdamW style) or
/// to the gradient (L2 penalty).
///
/// * decoupled: `p *= 1 - weight_decay * (fixed_decay ? 1 : lr)`
/// * coupled:   `grad += weight_decay * p`
pub fn apply_weight_decay(
    param: &mut ArrayD<TensorData>,
    grad: &mut ArrayD<TensorData>,
    lr: TensorData,
    weight_decay: TensorData,
    weight_decouple: bool,
    fixed_decay: bool,
) {
    if weight_decay == 0.0 {
        return;
    }
    if weight_decouple {
        let factor = 1.0 - weight_decay * if fixed_decay { 1.0 } else { lr };
        param.mapv_inplace(|p| p * factor);
    } else {
        Zip::from(grad).and(&*param).for_each(|g, &p| *g += weight_decay * p);
    }
}

/// `1 - beta^step`.
pub fn bias_correction(beta: TensorData, step: u64) -> TensorData {
    1.0 - beta.powi(step.min(i32::MAX as u64) as i32)
}

/// Exponential moving average: `avg = beta * avg + (1 - beta) * value`.
pub fn ema(avg: &mut ArrayD<TensorData>, value: &ArrayD<TensorData>, beta: TensorData) {
    Zip::from(avg).and(value).for_each(|a, &v| *a = beta * *a + (1.0 - beta) * v);
}

/// Squared-value moving average: `avg = beta * avg + (1 - beta) * value^2`.
pub fn ema_sq(avg: &mut ArrayD<TensorData>, value: &ArrayD<TensorData>, beta: TensorData) {
    Zip::from(avg).and(value).for_each(|a, &v| *a = beta * *a + (1.0 - beta) * v * v);
}
