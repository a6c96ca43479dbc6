//! # Tensor Module
//!
//! This module defines the `Tensor` parameter handle shared between a model
//! and the optimizers that update it, plus the numerical helpers in [`ops`].
//!
//! A `Tensor` is cheap to clone: clones share the same data and gradient
//! buffers, so an optimizer holding a clone references the model's parameter
//! instead of owning a copy of it.

use ndarray::{ArrayD, IxDyn};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// --- Submodules ---
pub mod ops;

// --- Error Handling ---
#[derive(thiserror::Error, Debug)]
pub enum TensorError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
    #[error("ndarray error: {0}")]
    NdarrayError(#[from] ndarray::ShapeError),
}

// Define a type alias for the underlying data type
pub type TensorData = f32;

/// # Tensor
///
/// A mutable multi-dimensional parameter buffer with an associated gradient
/// slot of identical shape.
///
/// Data is always kept in standard (row-major) layout so that flat views of
/// the buffer are available to optimizers that address elements by index.
#[derive(Clone, Debug)]
pub struct Tensor {
    data: Arc<RwLock<ArrayD<TensorData>>>,
    // `None` until a backward pass populates it.
    grad: Arc<RwLock<Option<ArrayD<TensorData>>>>,
    shape: Vec<usize>,
    /// Parameters with `requires_grad == false` are never touched by an optimizer.
    pub requires_grad: bool,
}

impl Tensor {
    /// Creates a new Tensor from an ndarray::ArrayD.
    pub fn new(data: ArrayD<TensorData>, requires_grad: bool) -> Self {
        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().into_owned()
        };
        let shape = data.shape().to_vec();
        Tensor {
            data: Arc::new(RwLock::new(data)),
            grad: Arc::new(RwLock::new(None)),
            shape,
            requires_grad,
        }
    }

    /// Creates a trainable Tensor from a flat vector of values.
    pub fn from_vec(shape: &[usize], values: Vec<TensorData>) -> Result<Self, TensorError> {
        let data = ArrayD::from_shape_vec(IxDyn(shape), values)?;
        Ok(Tensor::new(data, true))
    }

    /// Returns the shape of the tensor.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Returns the number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Returns the total number of elements.
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    /// Provides read-only access to the underlying data.
    pub fn data(&self) -> RwLockReadGuard<'_, ArrayD<TensorData>> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Provides mutable access to the underlying data.
    ///
    /// Callers must not change the shape of the buffer.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, ArrayD<TensorData>> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clones the underlying data into a new ArrayD.
    pub fn data_clone(&self) -> ArrayD<TensorData> {
        self.data().clone()
    }

    /// Overwrites the parameter values, keeping the buffer identity.
    pub fn assign(&self, values: &ArrayD<TensorData>) -> Result<(), TensorError> {
        if values.shape() != self.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: self.shape.clone(),
                got: values.shape().to_vec(),
            });
        }
        self.data_mut().assign(values);
        Ok(())
    }

    /// Retrieves a copy of the gradient, if one has been computed.
    pub fn grad(&self) -> Option<ArrayD<TensorData>> {
        self.grad_ref().clone()
    }

    /// Read access to the gradient slot.
    pub fn grad_ref(&self) -> RwLockReadGuard<'_, Option<ArrayD<TensorData>>> {
        self.grad.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write access to the gradient slot.
    pub fn grad_mut(&self) -> RwLockWriteGuard<'_, Option<ArrayD<TensorData>>> {
        self.grad.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores a gradient computed by an external backward pass.
    ///
    /// The shape is not checked here; optimizers reject mismatched gradients
    /// when they step.
    pub fn set_grad(&self, grad: ArrayD<TensorData>) {
        *self.grad_mut() = Some(grad);
    }

    /// Zeroes the gradient of the tensor if it exists.
    /// Commonly used by optimizers.
    pub fn zero_grad(&self) {
        if let Some(grad) = self.grad_mut().as_mut() {
            grad.fill(0.0);
        }
    }

    /// Returns `true` when both handles refer to the same parameter buffer.
    pub fn same_as(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

// --- Helper functions ---

/// Helper to create a tensor filled with zeros.
pub fn zeros(shape: &[usize], requires_grad: bool) -> Tensor {
    Tensor::new(ArrayD::zeros(IxDyn(shape)), requires_grad)
}

/// Helper to create a tensor filled with ones.
pub fn ones(shape: &[usize], requires_grad: bool) -> Tensor {
    Tensor::new(ArrayD::ones(IxDyn(shape)), requires_grad)
}
