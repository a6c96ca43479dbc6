//! Hyperparameter domain checks shared by the optimizer configs.
//!
//! Comparisons are written as `!(lo <= value)` so that NaN is rejected.

use crate::error::{OptimError, Result};

fn invalid(name: &'static str, value: f64, expected: &'static str) -> OptimError {
    OptimError::InvalidHyperparameter { name, value, expected }
}

pub fn learning_rate(lr: f32) -> Result<()> {
    non_negative("learning rate", lr)
}

pub fn non_negative(name: &'static str, value: f32) -> Result<()> {
    if !(0.0 <= value) {
        return Err(invalid(name, value as f64, ">= 0"));
    }
    Ok(())
}

pub fn positive(name: &'static str, value: f32) -> Result<()> {
    if !(0.0 < value) {
        return Err(invalid(name, value as f64, "> 0"));
    }
    Ok(())
}

/// `value` in `[0, 1)`.
pub fn beta(name: &'static str, value: f32) -> Result<()> {
    if !(0.0 <= value && value < 1.0) {
        return Err(invalid(name, value as f64, "in [0, 1)"));
    }
    Ok(())
}

pub fn betas(betas: (f32, f32)) -> Result<()> {
    beta("beta1", betas.0)?;
    beta("beta2", betas.1)
}

/// `value` in `[0, 1]`.
pub fn unit_interval(name: &'static str, value: f32) -> Result<()> {
    if !(0.0 <= value && value <= 1.0) {
        return Err(invalid(name, value as f64, "in [0, 1]"));
    }
    Ok(())
}

pub fn at_least_one(name: &'static str, value: usize) -> Result<()> {
    if value < 1 {
        return Err(invalid(name, value as f64, ">= 1"));
    }
    Ok(())
}
