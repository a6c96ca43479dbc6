//! # SGDSaI Optimizer
//!
//! SGD with momentum whose per-parameter learning rate is scaled by the
//! gradient signal-to-noise ratio measured once, at the parameter's first
//! step ("scale at initialization").

use super::functional::apply_weight_decay;
use super::state::{export_params, import_params, ParamState, StateDict, StateEntry};
use super::{build_groups, ensure_grad_shapes, first_lr, group_slices, push_group, validate};
use super::{GradientCheck, GroupConfig, Optimizer, ParamGroup, ParamKey};
use crate::error::Result;
use crate::tensor::{ops, Tensor, TensorData};
use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hyperparameters for [`SGDSaI`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SGDSaIConfig {
    pub lr: TensorData,
    pub momentum: TensorData,
    pub weight_decay: TensorData,
    pub weight_decouple: bool,
    pub eps: TensorData,
}

impl Default for SGDSaIConfig {
    fn default() -> Self {
        SGDSaIConfig {
            lr: 1e-2,
            momentum: 0.9,
            weight_decay: 1e-2,
            weight_decouple: true,
            eps: 1e-8,
        }
    }
}

impl GroupConfig for SGDSaIConfig {
    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn validate(&self) -> Result<()> {
        validate::learning_rate(self.lr)?;
        validate::beta("momentum", self.momentum)?;
        validate::non_negative("weight_decay", self.weight_decay)?;
        validate::non_negative("epsilon", self.eps)
    }
}

#[derive(Clone, Debug)]
struct SGDSaIParamState {
    step: u64,
    /// Gradient signal-to-noise ratio captured at the first step.
    gsnr: f64,
    momentum_buffer: Option<ArrayD<TensorData>>,
}

impl ParamState for SGDSaIParamState {
    fn to_entry(&self) -> StateEntry {
        let mut entry = StateEntry::new().with("step", self.step).with("gsnr", self.gsnr);
        if let Some(buf) = &self.momentum_buffer {
            entry.insert("momentum_buffer", buf.clone());
        }
        entry
    }

    fn from_entry(entry: &StateEntry, shape: &[usize]) -> Result<Self> {
        Ok(SGDSaIParamState {
            step: entry.count("step")?,
            gsnr: entry.scalar("gsnr")?,
            momentum_buffer: entry.optional_buffer("momentum_buffer", shape)?,
        })
    }
}

/// `||g|| / (std(g) + eps)`, or `||g||` when the gradient has no spread.
pub fn gradient_snr(grad: &ArrayD<TensorData>, eps: TensorData) -> f64 {
    let sigma = ops::std(grad);
    let grad_norm = ops::norm(grad);
    if sigma != 0.0 {
        grad_norm / (sigma + eps as f64)
    } else {
        grad_norm
    }
}

/// No More Adam: Learning Rate Scaling at Initialization is All You Need.
#[derive(Debug)]
pub struct SGDSaI {
    groups: Vec<ParamGroup<SGDSaIConfig>>,
    state: BTreeMap<ParamKey, SGDSaIParamState>,
    grads: GradientCheck,
}

impl SGDSaI {
    pub fn new<I>(params: I, config: SGDSaIConfig) -> Result<Self>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Self::with_groups(vec![ParamGroup::new(params, config)])
    }

    pub fn with_groups(groups: Vec<ParamGroup<SGDSaIConfig>>) -> Result<Self> {
        Ok(SGDSaI {
            groups: build_groups(groups)?,
            state: BTreeMap::new(),
            grads: GradientCheck::default(),
        })
    }

    pub fn add_param_group(&mut self, group: ParamGroup<SGDSaIConfig>) -> Result<()> {
        push_group(&mut self.groups, group)
    }
}

impl Optimizer for SGDSaI {
    fn name(&self) -> &'static str {
        "sgdsai"
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

                let state = self.state.entry(key).or_insert_with(|| SGDSaIParamState {
                    step: 0,
                    gsnr: gradient_snr(&grad, cfg.eps),
                    momentum_buffer: None,
                });
                state.step += 1;

                if cfg.momentum > 0.0 {
                    let buf = state.momentum_buffer.get_or_insert_with(|| grad.clone());
                    Zip::from(&mut *buf)
                        .and(&grad)
                        .for_each(|b, &g| *b = cfg.momentum * *b + (1.0 - cfg.momentum) * g);
                }

                apply_weight_decay(&mut data, &mut grad, cfg.lr, cfg.weight_decay, cfg.weight_decouple, false);

                let step_size = cfg.lr * state.gsnr as TensorData;
                let update = match (&state.momentum_buffer, cfg.momentum > 0.0) {
                    (Some(buf), true) => buf,
                    _ => &grad,
                };
                Zip::from(&mut *data).and(update).for_each(|p, &u| *p -= step_size * u);
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

    #[test]
    fn snr_of_constant_gradient_is_its_norm() {
        let g = arr1(&[3.0f32, 3.0, 3.0, 3.0]).into_dyn();
        assert!((gradient_snr(&g, 1e-8) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn gsnr_is_frozen_after_the_first_step() {
        let p = Tensor::from_vec(&[2], vec![0.0, 0.0]).unwrap();
        let cfg = SGDSaIConfig { lr: 0.1, weight_decay: 0.0, ..Default::default() };
        let mut opt = SGDSaI::new(vec![p.clone()], cfg).unwrap();

        p.set_grad(arr1(&[1.0, 3.0]).into_dyn());
        opt.step().unwrap();
        let first = opt.state_dict().params[&ParamKey::new(0, 0)].scalar("gsnr").unwrap();

        p.set_grad(arr1(&[5.0, -5.0]).into_dyn());
        opt.step().unwrap();
        let second = opt.state_dict().params[&ParamKey::new(0, 0)].scalar("gsnr").unwrap();

        // ||[1, 3]|| / std([1, 3]) = sqrt(10) / sqrt(2)
        assert!((first - 5f64.sqrt()).abs() < 1e-6);
        assert_eq!(first, second);
    }

    #[test]
    fn first_step_scales_lr_by_gsnr() {
        let p = Tensor::from_vec(&[2], vec![0.0, 0.0]).unwrap();
        let cfg = SGDSaIConfig { lr: 0.1, weight_decay: 0.0, ..Default::default() };
        let mut opt = SGDSaI::new(vec![p.clone()], cfg).unwrap();
        p.set_grad(arr1(&[1.0, 3.0]).into_dyn());
        opt.step().unwrap();

        let scale = 0.1 * 5f32.sqrt();
        let data = p.data_clone();
        assert!((data[[0]] + scale).abs() < 1e-5);
        assert!((data[[1]] + 3.0 * scale).abs() < 1e-5);
    }
}
