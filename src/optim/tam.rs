//! # TAM and AdaTAM Optimizers
//!
//! Torque-Aware Momentum. A running estimate `s` of the cosine between the
//! gradient and the momentum direction damps the gradient before it enters
//! the momentum: gradients that disagree with the accumulated direction are
//! shrunk towards `eps * g`, gradients that agree pass through whole.
//!
//! [`AdaTAM`] feeds the damped gradient into an Adam-style first moment and
//! normalizes by the undamped second moment.

use super::cautious::cautious;
use super::functional::{apply_weight_decay, bias_correction, ema, ema_sq};
use super::state::{export_params, import_params, ParamState, StateDict, StateEntry};
use super::{build_groups, ensure_grad_shapes, first_lr, group_slices, push_group, validate};
use super::{GradientCheck, GroupConfig, Optimizer, ParamGroup, ParamKey};
use crate::error::Result;
use crate::tensor::{ops, Tensor, TensorData};
use ndarray::{ArrayD, IxDyn, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Updates the correlation estimate `s` in place and returns the damped
/// gradient `((1 + s) / 2 + eps) * g`.
fn torque_damped(
    grad: &ArrayD<TensorData>,
    exp_avg: &ArrayD<TensorData>,
    s: &mut f64,
    decay: TensorData,
    eps: TensorData,
) -> ArrayD<TensorData> {
    let corr = ops::cosine_similarity(exp_avg, grad);
    let decay = decay as f64;
    *s = decay * *s + (1.0 - decay) * corr;
    let factor = ((1.0 + *s) / 2.0 + eps as f64) as TensorData;
    grad.mapv(|g| g * factor)
}

// --- TAM ---

/// Hyperparameters for [`TAM`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TAMConfig {
    pub lr: TensorData,
    pub momentum: TensorData,
    /// Decay of the gradient/momentum correlation estimate.
    pub decay: TensorData,
    pub weight_decay: TensorData,
    pub weight_decouple: bool,
    pub fixed_decay: bool,
    pub cautious: bool,
    pub eps: TensorData,
}

impl Default for TAMConfig {
    fn default() -> Self {
        TAMConfig {
            lr: 1e-1,
            momentum: 0.9,
            decay: 0.9,
            weight_decay: 0.0,
            weight_decouple: true,
            fixed_decay: false,
            cautious: false,
            eps: 1e-8,
        }
    }
}

impl GroupConfig for TAMConfig {
    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn validate(&self) -> Result<()> {
        validate::learning_rate(self.lr)?;
        validate::beta("momentum", self.momentum)?;
        validate::beta("decay", self.decay)?;
        validate::non_negative("weight_decay", self.weight_decay)?;
        validate::non_negative("epsilon", self.eps)
    }
}

#[derive(Clone, Debug)]
struct TAMParamState {
    step: u64,
    exp_avg: ArrayD<TensorData>,
    /// Running gradient/momentum correlation.
    s: f64,
}

impl ParamState for TAMParamState {
    fn to_entry(&self) -> StateEntry {
        StateEntry::new()
            .with("step", self.step)
            .with("exp_avg", self.exp_avg.clone())
            .with("s", self.s)
    }

    fn from_entry(entry: &StateEntry, shape: &[usize]) -> Result<Self> {
        Ok(TAMParamState {
            step: entry.count("step")?,
            exp_avg: entry.buffer("exp_avg", shape)?,
            s: entry.scalar("s")?,
        })
    }
}

/// Torque-Aware Momentum.
#[derive(Debug)]
pub struct TAM {
    groups: Vec<ParamGroup<TAMConfig>>,
    state: BTreeMap<ParamKey, TAMParamState>,
    grads: GradientCheck,
}

impl TAM {
    pub fn new<I>(params: I, config: TAMConfig) -> Result<Self>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Self::with_groups(vec![ParamGroup::new(params, config)])
    }

    pub fn with_groups(groups: Vec<ParamGroup<TAMConfig>>) -> Result<Self> {
        Ok(TAM {
            groups: build_groups(groups)?,
            state: BTreeMap::new(),
            grads: GradientCheck::default(),
        })
    }

    pub fn add_param_group(&mut self, group: ParamGroup<TAMConfig>) -> Result<()> {
        push_group(&mut self.groups, group)
    }
}

impl Optimizer for TAM {
    fn name(&self) -> &'static str {
        "tam"
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

                let state = self.state.entry(key).or_insert_with(|| TAMParamState {
                    step: 0,
                    exp_avg: grad.clone(),
                    s: 0.0,
                });
                state.step += 1;

                let damped = torque_damped(&grad, &state.exp_avg, &mut state.s, cfg.decay, cfg.eps);
                Zip::from(&mut state.exp_avg)
                    .and(&damped)
                    .for_each(|m, &d| *m = cfg.momentum * *m + d);

                apply_weight_decay(&mut data, &mut grad, cfg.lr, cfg.weight_decay, cfg.weight_decouple, cfg.fixed_decay);

                let update = if cfg.cautious {
                    cautious(state.exp_avg.clone(), &grad)
                } else {
                    state.exp_avg.clone()
                };
                Zip::from(&mut *data).and(&update).for_each(|p, &u| *p -= cfg.lr * u);
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

// --- AdaTAM ---

/// Hyperparameters for [`AdaTAM`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdaTAMConfig {
    pub lr: TensorData,
    pub betas: (TensorData, TensorData),
    pub decay: TensorData,
    pub weight_decay: TensorData,
    pub weight_decouple: bool,
    pub fixed_decay: bool,
    pub cautious: bool,
    pub eps: TensorData,
}

impl Default for AdaTAMConfig {
    fn default() -> Self {
        AdaTAMConfig {
            lr: 1e-3,
            betas: (0.9, 0.999),
            decay: 0.9,
            weight_decay: 0.0,
            weight_decouple: true,
            fixed_decay: false,
            cautious: false,
            eps: 1e-8,
        }
    }
}

impl GroupConfig for AdaTAMConfig {
    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn validate(&self) -> Result<()> {
        validate::learning_rate(self.lr)?;
        validate::betas(self.betas)?;
        validate::beta("decay", self.decay)?;
        validate::non_negative("weight_decay", self.weight_decay)?;
        validate::non_negative("epsilon", self.eps)
    }
}

#[derive(Clone, Debug)]
struct AdaTAMParamState {
    step: u64,
    exp_avg: ArrayD<TensorData>,
    exp_avg_sq: ArrayD<TensorData>,
    s: f64,
}

impl ParamState for AdaTAMParamState {
    fn to_entry(&self) -> StateEntry {
        StateEntry::new()
            .with("step", self.step)
            .with("exp_avg", self.exp_avg.clone())
            .with("exp_avg_sq", self.exp_avg_sq.clone())
            .with("s", self.s)
    }

    fn from_entry(entry: &StateEntry, shape: &[usize]) -> Result<Self> {
        Ok(AdaTAMParamState {
            step: entry.count("step")?,
            exp_avg: entry.buffer("exp_avg", shape)?,
            exp_avg_sq: entry.buffer("exp_avg_sq", shape)?,
            s: entry.scalar("s")?,
        })
    }
}

/// Adaptive Torque-Aware Momentum.
#[derive(Debug)]
pub struct AdaTAM {
    groups: Vec<ParamGroup<AdaTAMConfig>>,
    state: BTreeMap<ParamKey, AdaTAMParamState>,
    grads: GradientCheck,
}

impl AdaTAM {
    pub fn new<I>(params: I, config: AdaTAMConfig) -> Result<Self>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Self::with_groups(vec![ParamGroup::new(params, config)])
    }

    pub fn with_groups(groups: Vec<ParamGroup<AdaTAMConfig>>) -> Result<Self> {
        Ok(AdaTAM {
            groups: build_groups(groups)?,
            state: BTreeMap::new(),
            grads: GradientCheck::default(),
        })
    }

    pub fn add_param_group(&mut self, group: ParamGroup<AdaTAMConfig>) -> Result<()> {
        push_group(&mut self.groups, group)
    }
}

impl Optimizer for AdaTAM {
    fn name(&self) -> &'static str {
        "adatam"
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

                let state = self.state.entry(key).or_insert_with(|| {
                    let shape = IxDyn(param.shape());
                    AdaTAMParamState {
                        step: 0,
                        exp_avg: ArrayD::zeros(shape.clone()),
                        exp_avg_sq: ArrayD::zeros(shape),
                        s: 0.0,
                    }
                });
                state.step += 1;

                apply_weight_decay(&mut data, &mut grad, cfg.lr, cfg.weight_decay, cfg.weight_decouple, cfg.fixed_decay);

                let damped = torque_damped(&grad, &state.exp_avg, &mut state.s, cfg.decay, cfg.eps);
                ema(&mut state.exp_avg, &damped, beta1);
                ema_sq(&mut state.exp_avg_sq, &grad, beta2);

                let bias_correction1 = bias_correction(beta1, state.step);
                let bias_correction2 = bias_correction(beta2, state.step);

                let update = if cfg.cautious {
                    cautious(state.exp_avg.clone(), &grad)
                } else {
                    state.exp_avg.clone()
                };
                Zip::from(&mut *data)
                    .and(&update)
                    .and(&state.exp_avg_sq)
                    .for_each(|p, &m, &v| {
                        let de_nom = (v / bias_correction2).sqrt() + cfg.eps;
                        *p -= cfg.lr * (m / bias_correction1) / de_nom;
                    });
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
