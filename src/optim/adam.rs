//! # Adam Optimizer
//!
//! Adam with optional decoupled weight decay (AdamW), AMSGrad and cautious
//! masking.

use super::cautious::cautious;
use super::functional::{apply_weight_decay, bias_correction, ema, ema_sq};
use super::state::{export_params, import_params, ParamState, StateDict, StateEntry};
use super::{build_groups, ensure_grad_shapes, first_lr, group_slices, push_group, validate};
use super::{GradientCheck, GroupConfig, Optimizer, ParamGroup, ParamKey};
use crate::error::Result;
use crate::tensor::{Tensor, TensorData};
use ndarray::{ArrayD, IxDyn, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hyperparameters for [`Adam`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdamConfig {
    pub lr: TensorData,
    /// Coefficients used for computing running averages of gradient and its square.
    pub betas: (TensorData, TensorData),
    /// Term added to the denominator to improve numerical stability.
    pub eps: TensorData,
    pub weight_decay: TensorData,
    /// Apply weight decay to the parameter instead of the gradient (AdamW).
    pub weight_decouple: bool,
    /// Whether to use the AMSGrad variant of this algorithm.
    pub amsgrad: bool,
    pub cautious: bool,
}

impl Default for AdamConfig {
    fn default() -> Self {
        AdamConfig {
            lr: 1e-3,
            betas: (0.9, 0.999),
            eps: 1e-8,
            weight_decay: 0.0,
            weight_decouple: false,
            amsgrad: false,
            cautious: false,
        }
    }
}

impl AdamConfig {
    /// AdamW defaults: decoupled weight decay of 1e-2.
    pub fn adamw() -> Self {
        AdamConfig {
            weight_decay: 1e-2,
            weight_decouple: true,
            ..Default::default()
        }
    }
}

impl GroupConfig for AdamConfig {
    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn validate(&self) -> Result<()> {
        validate::learning_rate(self.lr)?;
        validate::betas(self.betas)?;
        validate::non_negative("epsilon", self.eps)?;
        validate::non_negative("weight_decay", self.weight_decay)
    }
}

#[derive(Clone, Debug)]
struct AdamParamState {
    step: u64,
    exp_avg: ArrayD<TensorData>,                // 1st moment estimate (momentum) - m_t
    exp_avg_sq: ArrayD<TensorData>,             // 2nd moment estimate - v_t
    max_exp_avg_sq: Option<ArrayD<TensorData>>, // Max v_t, only used if amsgrad = true
}

impl ParamState for AdamParamState {
    fn to_entry(&self) -> StateEntry {
        let mut entry = StateEntry::new()
            .with("step", self.step)
            .with("exp_avg", self.exp_avg.clone())
            .with("exp_avg_sq", self.exp_avg_sq.clone());
        if let Some(max) = &self.max_exp_avg_sq {
            entry.insert("max_exp_avg_sq", max.clone());
        }
        entry
    }

    fn from_entry(entry: &StateEntry, shape: &[usize]) -> Result<Self> {
        Ok(AdamParamState {
            step: entry.count("step")?,
            exp_avg: entry.buffer("exp_avg", shape)?,
            exp_avg_sq: entry.buffer("exp_avg_sq", shape)?,
            max_exp_avg_sq: entry.optional_buffer("max_exp_avg_sq", shape)?,
        })
    }
}

/// Implements the Adam algorithm.
/// Reference: Adam: A Method for Stochastic Optimization - https://arxiv.org/abs/1412.6980
#[derive(Debug)]
pub struct Adam {
    groups: Vec<ParamGroup<AdamConfig>>,
    state: BTreeMap<ParamKey, AdamParamState>,
    grads: GradientCheck,
}

impl Adam {
    pub fn new<I>(params: I, config: AdamConfig) -> Result<Self>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Self::with_groups(vec![ParamGroup::new(params, config)])
    }

    pub fn with_groups(groups: Vec<ParamGroup<AdamConfig>>) -> Result<Self> {
        Ok(Adam {
            groups: build_groups(groups)?,
            state: BTreeMap::new(),
            grads: GradientCheck::default(),
        })
    }

    pub fn add_param_group(&mut self, group: ParamGroup<AdamConfig>) -> Result<()> {
        push_group(&mut self.groups, group)
    }
}

impl Optimizer for Adam {
    fn name(&self) -> &'static str {
        match self.groups.first() {
            Some(g) if g.config.weight_decouple => "adamw",
            _ => "adam",
        }
    }

    fn step(&mut self) -> Result<()> {
        ensure_grad_shapes(&group_slices(&self.groups))?;

        for (g, group) in self.groups.iter().enumerate() {
            let cfg = &group.config;
            let (beta1, beta2) = cfg.betas;
            for (i, param) in group.params.iter().enumerate() {
                let key = ParamKey::new(g, i);
                let mut grad = match self.grads.read(param, key)? {
                    Some(grad) => grad,
                    None => continue,
                };
                let mut data = param.data_mut();
                apply_weight_decay(&mut data, &mut grad, cfg.lr, cfg.weight_decay, cfg.weight_decouple, false);

                let state = self.state.entry(key).or_insert_with(|| {
                    let shape = IxDyn(param.shape());
                    AdamParamState {
                        step: 0,
                        exp_avg: ArrayD::zeros(shape.clone()),
                        exp_avg_sq: ArrayD::zeros(shape.clone()),
                        max_exp_avg_sq: if cfg.amsgrad { Some(ArrayD::zeros(shape)) } else { None },
                    }
                });
                state.step += 1;

                // Step size correction as in PyTorch: lr * sqrt(bc2) / bc1
                let step_size = cfg.lr * bias_correction(beta2, state.step).sqrt() / bias_correction(beta1, state.step);

                ema(&mut state.exp_avg, &grad, beta1);
                ema_sq(&mut state.exp_avg_sq, &grad, beta2);

                // denom = sqrt(v_t) + eps, or sqrt(max v_t) + eps for AMSGrad
                let mut denom = match state.max_exp_avg_sq.as_mut() {
                    Some(max) if cfg.amsgrad => {
                        Zip::from(&mut *max).and(&state.exp_avg_sq).for_each(|m, &v| *m = m.max(v));
                        max.clone()
                    }
                    _ => state.exp_avg_sq.clone(),
                };
                denom.mapv_inplace(|v| v.sqrt() + cfg.eps);

                let update = if cfg.cautious {
                    cautious(state.exp_avg.clone(), &grad)
                } else {
                    state.exp_avg.clone()
                };

                Zip::from(&mut *data)
                    .and(&update)
                    .and(&denom)
                    .for_each(|p, &m, &d| *p -= step_size * m / d);
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
