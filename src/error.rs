//! # Error Types
//!
//! Errors raised by optimizers, wrappers and the optimizer factory.

use crate::optim::ParamKey;
use crate::tensor::TensorError;
use crate::utils::serialization::SerializationError;

#[derive(thiserror::Error, Debug)]
pub enum OptimError {
    // --- Configuration errors (construction / factory time) ---
    #[error("Invalid {name}: {value} (expected {expected})")]
    InvalidHyperparameter {
        name: &'static str,
        value: f64,
        expected: &'static str,
    },
    #[error("Missing required option '{option}' for optimizer '{optimizer}'")]
    MissingOption { optimizer: String, option: String },
    #[error("Option '{option}' is not accepted by optimizer '{optimizer}'")]
    UnknownOption { optimizer: String, option: String },
    #[error("Option '{option}' has the wrong type: expected {expected}")]
    OptionType { option: String, expected: &'static str },
    #[error("Unknown optimizer '{0}'")]
    UnknownOptimizer(String),
    #[error("Optimizer got an empty parameter list")]
    EmptyParameters,
    #[error("Parameter {key} also appears in an earlier parameter group")]
    DuplicateParameter { key: ParamKey },

    // --- Per-step errors ---
    #[error("Gradient shape mismatch for parameter {key}: expected {expected:?}, got {got:?}")]
    GradShapeMismatch {
        key: ParamKey,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    // --- Wrapper consistency ---
    #[error("Parameter groups of {wrapper} diverged from the wrapped optimizer: {reason}")]
    GroupMismatch { wrapper: &'static str, reason: String },

    // --- Checkpointing ---
    #[error("Invalid state dict: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Tensor(#[from] TensorError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
}

pub type Result<T> = std::result::Result<T, OptimError>;
