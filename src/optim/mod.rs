//! # Optimization Algorithms (`optim`)
//!
//! Update rules that consume externally computed gradients and mutate the
//! parameters they reference, plus wrapper optimizers that compose with any
//! inner optimizer:
//!
//! - Update rules: [`SGD`], [`Adam`], [`AdaBound`], [`Yogi`], [`SGDSaI`],
//!   [`SPAM`], [`TAM`], [`AdaTAM`]
//! - Gradient transform: [`OrthoGrad`]
//! - Composition: [`Lookahead`], [`TRAC`]
//! - Construction by name: [`create_optimizer`]
//!
//! Every optimizer is driven the same way: the training loop populates
//! gradients, calls [`Optimizer::step`] once, then [`Optimizer::zero_grad`].

use crate::error::{OptimError, Result};
use crate::tensor::{ops, Tensor, TensorData};
use log::warn;
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

// --- Submodules ---
pub mod adabound;
pub mod adam;
pub mod cautious;
pub mod factory;
pub mod functional;
pub mod inner;
pub mod lookahead;
pub mod orthograd;
pub mod sgd;
pub mod sgdsai;
pub mod spam;
pub mod state;
pub mod tam;
pub mod trac;
pub mod validate;
pub mod yogi;

// Re-export optimizers
pub use adabound::{AdaBound, AdaBoundConfig};
pub use adam::{Adam, AdamConfig};
pub use cautious::{cautious, cautious_mask};
pub use factory::{create_optimizer, registered_optimizers, OptimizerOptions, OptionValue};
pub use inner::InnerOptimizer;
pub use lookahead::{Lookahead, LookaheadConfig};
pub use orthograd::{orthogonalize, OrthoGrad, OrthoGradConfig};
pub use sgd::{SGDConfig, SGD};
pub use sgdsai::{SGDSaI, SGDSaIConfig};
pub use spam::{SPAMConfig, SPAM};
pub use state::{ParamState, StateDict, StateEntry, StateValue};
pub use tam::{AdaTAM, AdaTAMConfig, TAMConfig, TAM};
pub use trac::{TRACConfig, TRAC};
pub use yogi::{Yogi, YogiConfig};

// --- Optimizer Trait ---

/// Base trait for all optimizers, including wrappers.
pub trait Optimizer {
    /// Registry name of the optimizer (e.g. `"adamw"`, `"lookahead"`).
    fn name(&self) -> &'static str;

    /// Performs a single optimization step over every parameter group.
    ///
    /// Parameters without a gradient are skipped. A gradient whose shape
    /// disagrees with its parameter aborts the step before any parameter is
    /// modified.
    fn step(&mut self) -> Result<()>;

    /// Zeros the gradients of all parameters managed by the optimizer.
    fn zero_grad(&mut self) {
        for group in self.param_groups() {
            for param in group {
                param.zero_grad();
            }
        }
    }

    /// Parameter handles, one slice per group, in construction order.
    fn param_groups(&self) -> Vec<&[Tensor]>;

    /// Learning rate of the first parameter group.
    fn learning_rate(&self) -> f32;

    /// Snapshot of the optimizer's persistent state.
    fn state_dict(&self) -> StateDict;

    /// Restores a snapshot taken by [`Optimizer::state_dict`]. On error the
    /// live state is left untouched.
    fn load_state_dict(&mut self, state: &StateDict) -> Result<()>;
}

impl<O: Optimizer + ?Sized> Optimizer for Box<O> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn step(&mut self) -> Result<()> {
        (**self).step()
    }

    fn zero_grad(&mut self) {
        (**self).zero_grad()
    }

    fn param_groups(&self) -> Vec<&[Tensor]> {
        (**self).param_groups()
    }

    fn learning_rate(&self) -> f32 {
        (**self).learning_rate()
    }

    fn state_dict(&self) -> StateDict {
        (**self).state_dict()
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        (**self).load_state_dict(state)
    }
}

// --- Parameter Groups ---

/// Hyperparameters shared by every parameter of a group.
pub trait GroupConfig: Clone + fmt::Debug {
    fn learning_rate(&self) -> f32;

    /// Rejects out-of-domain values.
    fn validate(&self) -> Result<()>;
}

/// An ordered collection of parameters sharing one configuration.
#[derive(Clone, Debug)]
pub struct ParamGroup<C> {
    pub params: Vec<Tensor>,
    pub config: C,
}

impl<C: GroupConfig> ParamGroup<C> {
    pub fn new<I>(params: I, config: C) -> Self
    where
        I: IntoIterator<Item = Tensor>,
    {
        ParamGroup {
            params: params.into_iter().collect(),
            config,
        }
    }
}

/// Address of a parameter inside an optimizer: group position, then
/// position within the group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParamKey {
    pub group: usize,
    pub index: usize,
}

impl ParamKey {
    pub fn new(group: usize, index: usize) -> Self {
        ParamKey { group, index }
    }
}

impl fmt::Display for ParamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.group, self.index)
    }
}

/// Validates group configurations and rejects parameters shared between
/// groups.
pub(crate) fn build_groups<C: GroupConfig>(groups: Vec<ParamGroup<C>>) -> Result<Vec<ParamGroup<C>>> {
    if groups.iter().all(|g| g.params.is_empty()) {
        return Err(OptimError::EmptyParameters);
    }
    for group in &groups {
        group.config.validate()?;
    }
    let mut seen: Vec<&Tensor> = Vec::new();
    for (g, group) in groups.iter().enumerate() {
        for (i, param) in group.params.iter().enumerate() {
            if seen.iter().any(|p| p.same_as(param)) {
                return Err(OptimError::DuplicateParameter { key: ParamKey::new(g, i) });
            }
            seen.push(param);
        }
    }
    Ok(groups)
}

/// Appends a group to an existing list, with the same checks as construction.
pub(crate) fn push_group<C: GroupConfig>(groups: &mut Vec<ParamGroup<C>>, group: ParamGroup<C>) -> Result<()> {
    group.config.validate()?;
    let g = groups.len();
    for (i, param) in group.params.iter().enumerate() {
        if groups.iter().flat_map(|gr| gr.params.iter()).any(|p| p.same_as(param)) {
            return Err(OptimError::DuplicateParameter { key: ParamKey::new(g, i) });
        }
    }
    groups.push(group);
    Ok(())
}

pub(crate) fn group_slices<C>(groups: &[ParamGroup<C>]) -> Vec<&[Tensor]> {
    groups.iter().map(|g| g.params.as_slice()).collect()
}

pub(crate) fn first_lr<C: GroupConfig>(groups: &[ParamGroup<C>]) -> f32 {
    groups.first().map(|g| g.config.learning_rate()).unwrap_or(0.0)
}

// --- Gradient access ---

/// Checks every gradient against its parameter's shape.
pub(crate) fn ensure_grad_shapes(groups: &[&[Tensor]]) -> Result<()> {
    for (g, group) in groups.iter().enumerate() {
        for (i, param) in group.iter().enumerate() {
            if let Some(grad) = param.grad_ref().as_ref() {
                if grad.shape() != param.shape() {
                    return Err(OptimError::GradShapeMismatch {
                        key: ParamKey::new(g, i),
                        expected: param.shape().to_vec(),
                        got: grad.shape().to_vec(),
                    });
                }
            }
        }
    }
    Ok(())
}

/// Copy of the gradient of a trainable parameter, shape-checked but
/// possibly non-finite.
pub(crate) fn checked_grad(param: &Tensor, key: ParamKey) -> Result<Option<ArrayD<TensorData>>> {
    if !param.requires_grad {
        return Ok(None);
    }
    let grad = match param.grad() {
        Some(g) => g,
        None => return Ok(None),
    };
    if grad.shape() != param.shape() {
        return Err(OptimError::GradShapeMismatch {
            key,
            expected: param.shape().to_vec(),
            got: grad.shape().to_vec(),
        });
    }
    Ok(Some(grad))
}

/// Reads gradients for a step, reporting each parameter with a non-finite
/// gradient once over the optimizer's lifetime.
#[derive(Debug, Default)]
pub(crate) struct GradientCheck {
    reported: HashSet<ParamKey>,
}

impl GradientCheck {
    /// Returns the gradient to apply, or `None` when the parameter should be
    /// skipped this step.
    pub(crate) fn read(&mut self, param: &Tensor, key: ParamKey) -> Result<Option<ArrayD<TensorData>>> {
        let grad = match checked_grad(param, key)? {
            Some(g) => g,
            None => return Ok(None),
        };
        if !ops::all_finite(&grad) {
            if self.reported.insert(key) {
                warn!("non-finite gradient for parameter {key}; skipping its update");
            }
            return Ok(None);
        }
        Ok(Some(grad))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::zeros;
    use ndarray::{arr1, IxDyn};

    #[derive(Clone, Debug)]
    struct Lr(f32);

    impl GroupConfig for Lr {
        fn learning_rate(&self) -> f32 {
            self.0
        }
        fn validate(&self) -> Result<()> {
            validate::learning_rate(self.0)
        }
    }

    #[test]
    fn duplicate_parameters_are_rejected() {
        let p = zeros(&[2], true);
        let err = build_groups(vec![
            ParamGroup::new(vec![p.clone()], Lr(0.1)),
            ParamGroup::new(vec![zeros(&[1], true), p], Lr(0.1)),
        ])
        .unwrap_err();
        assert!(matches!(err, OptimError::DuplicateParameter { key } if key == ParamKey::new(1, 1)));
    }

    #[test]
    fn empty_and_invalid_groups_are_rejected() {
        assert!(matches!(
            build_groups::<Lr>(vec![ParamGroup::new(vec![], Lr(0.1))]),
            Err(OptimError::EmptyParameters)
        ));
        assert!(matches!(
            build_groups(vec![ParamGroup::new(vec![zeros(&[1], true)], Lr(-1.0))]),
            Err(OptimError::InvalidHyperparameter { .. })
        ));
    }

    #[test]
    fn gradient_check_skips_non_finite() {
        let p = zeros(&[2], true);
        let mut check = GradientCheck::default();
        assert!(check.read(&p, ParamKey::new(0, 0)).unwrap().is_none());

        p.set_grad(arr1(&[1.0, f32::INFINITY]).into_dyn());
        assert!(check.read(&p, ParamKey::new(0, 0)).unwrap().is_none());
        assert!(check.reported.contains(&ParamKey::new(0, 0)));

        p.set_grad(ArrayD::zeros(IxDyn(&[3])));
        let err = check.read(&p, ParamKey::new(0, 0)).unwrap_err();
        assert!(matches!(err, OptimError::GradShapeMismatch { .. }));
        assert!(ensure_grad_shapes(&[std::slice::from_ref(&p)]).is_err());
    }

    #[test]
    fn checked_grad_passes_non_finite_values_through() {
        let p = zeros(&[2], true);
        p.set_grad(arr1(&[f32::NAN, 1.0]).into_dyn());
        let grad = checked_grad(&p, ParamKey::new(0, 0)).unwrap().unwrap();
        assert!(!ops::all_finite(&grad));

        let frozen = zeros(&[2], false);
        frozen.set_grad(arr1(&[1.0, 1.0]).into_dyn());
        assert!(checked_grad(&frozen, ParamKey::new(0, 1)).unwrap().is_none());
    }
}
