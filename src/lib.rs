//! # RTorch Optimizers
//!
//! This crate provides the optimizer layer of RTorch: stateful update rules
//! that consume externally computed gradients, and wrapper optimizers that
//! compose with any of them.
//!
//! ```no_run
//! use rtorch_optim::optim::{create_optimizer, OptimizerOptions};
//! use rtorch_optim::tensor::Tensor;
//!
//! # fn main() -> rtorch_optim::Result<()> {
//! let w = Tensor::from_vec(&[2], vec![1.0, -1.0])?;
//! let options = OptimizerOptions::new().with("lr", 0.1).with("lookahead", true);
//! let mut opt = create_optimizer("sgdsai", vec![w.clone()], &options)?;
//!
//! // gradients come from the caller's backward pass
//! w.set_grad(ndarray::arr1(&[0.5, -0.5]).into_dyn());
//! opt.step()?;
//! opt.zero_grad();
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod optim;
pub mod tensor;
pub mod utils;

pub use error::{OptimError, Result};
pub use optim::{create_optimizer, Optimizer, OptimizerOptions, ParamGroup, ParamKey, StateDict};
pub use tensor::Tensor;
