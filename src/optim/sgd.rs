//! # Stochastic Gradient Descent (SGD) Optimizer

use super::state::{export_params, import_params, ParamState, StateDict, StateEntry};
use super::{build_groups, ensure_grad_shapes, first_lr, group_slices, push_group, validate};
use super::{GradientCheck, GroupConfig, Optimizer, ParamGroup, ParamKey};
use crate::error::{OptimError, Result};
use crate::tensor::{Tensor, TensorData};
use ndarray::{ArrayD, IxDyn, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hyperparameters for [`SGD`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SGDConfig {
    pub lr: TensorData,
    /// Momentum factor (default: 0).
    pub momentum: TensorData,
    /// Dampening for momentum (default: 0).
    pub dampening: TensorData,
    /// Weight decay (L2 penalty) (default: 0).
    pub weight_decay: TensorData,
    /// Enables Nesterov momentum (default: false).
    pub nesterov: bool,
}

impl Default for SGDConfig {
    fn default() -> Self {
        SGDConfig {
            lr: 1e-3,
            momentum: 0.0,
            dampening: 0.0,
            weight_decay: 0.0,
            nesterov: false,
        }
    }
}

impl GroupConfig for SGDConfig {
    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn validate(&self) -> Result<()> {
        validate::learning_rate(self.lr)?;
        validate::non_negative("momentum", self.momentum)?;
        validate::non_negative("dampening", self.dampening)?;
        validate::non_negative("weight_decay", self.weight_decay)?;
        if self.nesterov && (self.momentum <= 0.0 || self.dampening != 0.0) {
            return Err(OptimError::InvalidHyperparameter {
                name: "nesterov momentum",
                value: self.momentum as f64,
                expected: "momentum > 0 and dampening = 0",
            });
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct SGDParamState {
    step: u64,
    momentum_buffer: ArrayD<TensorData>,
}

impl ParamState for SGDParamState {
    fn to_entry(&self) -> StateEntry {
        StateEntry::new()
            .with("step", self.step)
            .with("momentum_buffer", self.momentum_buffer.clone())
    }

    fn from_entry(entry: &StateEntry, shape: &[usize]) -> Result<Self> {
        Ok(SGDParamState {
            step: entry.count("step")?,
            momentum_buffer: entry.buffer("momentum_buffer", shape)?,
        })
    }
}

/// Implements the Stochastic Gradient Descent optimizer.
/// Supports momentum, dampening, weight decay, and Nesterov momentum.
#[derive(Debug)]
pub struct SGD {
    groups: Vec<ParamGroup<SGDConfig>>,
    state: BTreeMap<ParamKey, SGDParamState>,
    grads: GradientCheck,
}

impl SGD {
    /// Creates a new SGD optimizer over a single parameter group.
    pub fn new<I>(params: I, config: SGDConfig) -> Result<Self>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Self::with_groups(vec![ParamGroup::new(params, config)])
    }

    pub fn with_groups(groups: Vec<ParamGroup<SGDConfig>>) -> Result<Self> {
        Ok(SGD {
            groups: build_groups(groups)?,
            state: BTreeMap::new(),
            grads: GradientCheck::default(),
        })
    }

    /// Simplified constructor with only lr.
    pub fn simple<I>(params: I, lr: TensorData) -> Result<Self>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Self::new(params, SGDConfig { lr, ..Default::default() })
    }

    pub fn add_param_group(&mut self, group: ParamGroup<SGDConfig>) -> Result<()> {
        push_group(&mut self.groups, group)
    }
}

impl Optimizer for SGD {
    fn name(&self) -> &'static str {
        "sgd"
    }

    fn step(&mut self) -> Result<()> {
        ensure_grad_shapes(&group_slices(&self.groups))?;

        for (g, group) in self.groups.iter().enumerate() {
            let cfg = &group.config;
            for (i, param) in group.params.iter().enumerate() {
                let key = ParamKey::new(g, i);
                let mut grad = match self.grads.read(param, key)? {
                    Some(grad) => grad,
                    None => continue,
                };
                let mut data = param.data_mut();

                // --- Weight Decay ---
                // grad = grad + param * weight_decay
                if cfg.weight_decay != 0.0 {
                    Zip::from(&mut grad).and(&*data).for_each(|g, &p| *g += cfg.weight_decay * p);
                }

                let state = self.state.entry(key).or_insert_with(|| SGDParamState {
                    step: 0,
                    momentum_buffer: ArrayD::zeros(IxDyn(param.shape())),
                });
                state.step += 1;

                // --- Momentum ---
                if cfg.momentum != 0.0 {
                    // buf = momentum * buf + (1 - dampening) * grad
                    let buf = &mut state.momentum_buffer;
                    Zip::from(&mut *buf)
                        .and(&grad)
                        .for_each(|b, &g| *b = cfg.momentum * *b + (1.0 - cfg.dampening) * g);

                    if cfg.nesterov {
                        // grad = grad + momentum * buf
                        Zip::from(&mut grad).and(&*buf).for_each(|g, &b| *g += cfg.momentum * b);
                    } else {
                        grad.assign(buf);
                    }
                }

                // --- Parameter Update ---
                // param = param - lr * grad
                Zip::from(&mut *data).and(&grad).for_each(|p, &g| *p -= cfg.lr * g);
            }
        }
        Ok(())
    }

    fn param_groups(&self) -> Vec<&[Tensor]> {
        group_slices(&self.groups)
    }

    fn learning_rate(&self) -> f32 {
        first_lr(&self.groups)
    }

    fn state_dict(&self) -> StateDict {
        let mut dict = StateDict::new(self.name(), &self.param_groups());
        export_params(&mut dict, &self.state);
        dict
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let groups = self.param_groups();
        state.check_header(self.name(), &groups)?;
        let restored = import_params(state, &groups)?;
        self.state = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    fn param(values: &[f32]) -> Tensor {
        Tensor::from_vec(&[values.len()], values.to_vec()).unwrap()
    }

    #[test]
    fn plain_sgd_step() {
        let p = param(&[1.0, 2.0]);
        let mut opt = SGD::simple(vec![p.clone()], 0.5).unwrap();
        p.set_grad(arr1(&[1.0, -2.0]).into_dyn());
        opt.step().unwrap();
        assert_eq!(p.data_clone(), arr1(&[0.5f32, 3.0]).into_dyn());
    }

    #[test]
    fn momentum_accumulates() {
        let p = param(&[0.0]);
        let cfg = SGDConfig { lr: 1.0, momentum: 0.5, ..Default::default() };
        let mut opt = SGD::new(vec![p.clone()], cfg).unwrap();
        p.set_grad(arr1(&[1.0]).into_dyn());
        opt.step().unwrap(); // buf = 1
        opt.step().unwrap(); // buf = 1.5
        assert_eq!(p.data()[[0]], -2.5);
    }

    #[test]
    fn nesterov_requires_momentum() {
        let cfg = SGDConfig { nesterov: true, ..Default::default() };
        assert!(SGD::new(vec![param(&[0.0])], cfg).is_err());
    }

    #[test]
    fn shape_mismatch_aborts_before_any_update() {
        let a = param(&[1.0]);
        let b = param(&[1.0, 1.0]);
        let mut opt = SGD::simple(vec![a.clone(), b.clone()], 0.1).unwrap();
        a.set_grad(arr1(&[1.0]).into_dyn());
        b.set_grad(arr1(&[1.0]).into_dyn());
        let err = opt.step().unwrap_err();
        assert!(matches!(err, OptimError::GradShapeMismatch { key, .. } if key == ParamKey::new(0, 1)));
        assert_eq!(a.data()[[0]], 1.0);
    }
}
