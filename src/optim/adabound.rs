//! # AdaBound Optimizer

use super::functional::{apply_weight_decay, bias_correction, ema, ema_sq};
use super::state::{export_params, import_params, ParamState, StateDict, StateEntry};
use super::{build_groups, ensure_grad_shapes, first_lr, group_slices, push_group, validate};
use super::{GradientCheck, GroupConfig, Optimizer, ParamGroup, ParamKey};
use crate::error::Result;
use crate::tensor::{Tensor, TensorData};
use ndarray::{ArrayD, IxDyn, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hyperparameters for [`AdaBound`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdaBoundConfig {
    pub lr: TensorData,
    /// Learning rate the bounds converge to.
    pub final_lr: TensorData,
    pub betas: (TensorData, TensorData),
    /// Convergence speed of the bound functions.
    pub gamma: TensorData,
    pub weight_decay: TensorData,
    pub weight_decouple: bool,
    pub fixed_decay: bool,
    /// Bound with the running max of the second moment (AMSBound).
    pub ams_bound: bool,
    /// Only correct the denominator, not the step size.
    pub adam_debias: bool,
    pub eps: TensorData,
}

impl Default for AdaBoundConfig {
    fn default() -> Self {
        AdaBoundConfig {
            lr: 1e-3,
            final_lr: 1e-1,
            betas: (0.9, 0.999),
            gamma: 1e-3,
            weight_decay: 0.0,
            weight_decouple: true,
            fixed_decay: false,
            ams_bound: false,
            adam_debias: false,
            eps: 1e-8,
        }
    }
}

impl GroupConfig for AdaBoundConfig {
    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn validate(&self) -> Result<()> {
        validate::learning_rate(self.lr)?;
        validate::non_negative("final_lr", self.final_lr)?;
        validate::betas(self.betas)?;
        validate::positive("gamma", self.gamma)?;
        validate::non_negative("weight_decay", self.weight_decay)?;
        validate::non_negative("epsilon", self.eps)
    }
}

#[derive(Clone, Debug)]
struct AdaBoundParamState {
    step: u64,
    exp_avg: ArrayD<TensorData>,
    exp_avg_sq: ArrayD<TensorData>,
    max_exp_avg_sq: Option<ArrayD<TensorData>>,
}

impl ParamState for AdaBoundParamState {
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
        Ok(AdaBoundParamState {
            step: entry.count("step")?,
            exp_avg: entry.buffer("exp_avg", shape)?,
            exp_avg_sq: entry.buffer("exp_avg_sq", shape)?,
            max_exp_avg_sq: entry.optional_buffer("max_exp_avg_sq", shape)?,
        })
    }
}

/// Adaptive Gradient Methods with Dynamic Bound of Learning Rate.
///
/// The per-element Adam step size is clipped into a band around `final_lr`
/// that narrows as training progresses, so the rule moves from Adam-like to
/// SGD-like behavior.
#[derive(Debug)]
pub struct AdaBound {
    groups: Vec<ParamGroup<AdaBoundConfig>>,
    state: BTreeMap<ParamKey, AdaBoundParamState>,
    grads: GradientCheck,
}

impl AdaBound {
    pub fn new<I>(params: I, config: AdaBoundConfig) -> Result<Self>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Self::with_groups(vec![ParamGroup::new(params, config)])
    }

    pub fn with_groups(groups: Vec<ParamGroup<AdaBoundConfig>>) -> Result<Self> {
        Ok(AdaBound {
            groups: build_groups(groups)?,
            state: BTreeMap::new(),
            grads: GradientCheck::default(),
        })
    }

    pub fn add_param_group(&mut self, group: ParamGroup<AdaBoundConfig>) -> Result<()> {
        push_group(&mut self.groups, group)
    }
}

impl Optimizer for AdaBound {
    fn name(&self) -> &'static str {
        "adabound"
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
                    AdaBoundParamState {
                        step: 0,
                        exp_avg: ArrayD::zeros(shape.clone()),
                        exp_avg_sq: ArrayD::zeros(shape.clone()),
                        max_exp_avg_sq: if cfg.ams_bound { Some(ArrayD::zeros(shape)) } else { None },
                    }
                });
                state.step += 1;
                let step = state.step as TensorData;

                let lower_bound = cfg.final_lr * (1.0 - 1.0 / (cfg.gamma * step + 1.0));
                let upper_bound = cfg.final_lr * (1.0 + 1.0 / (cfg.gamma * step));

                apply_weight_decay(&mut data, &mut grad, cfg.lr, cfg.weight_decay, cfg.weight_decouple, cfg.fixed_decay);

                ema(&mut state.exp_avg, &grad, beta1);
                ema_sq(&mut state.exp_avg_sq, &grad, beta2);

                let second = match state.max_exp_avg_sq.as_mut() {
                    Some(max) if cfg.ams_bound => {
                        Zip::from(&mut *max).and(&state.exp_avg_sq).for_each(|m, &v| *m = m.max(v));
                        &*max
                    }
                    _ => &state.exp_avg_sq,
                };

                let mut step_size = cfg.lr * bias_correction(beta2, state.step).sqrt();
                if !cfg.adam_debias {
                    step_size /= bias_correction(beta1, state.step);
                }

                Zip::from(&mut *data)
                    .and(&state.exp_avg)
                    .and(second)
                    .for_each(|p, &m, &v| {
                        let de_nom = (v + cfg.eps).sqrt();
                        *p -= (step_size / de_nom).clamp(lower_bound, upper_bound) * m;
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

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn step_size_is_clamped_to_the_bounds() {
        // final_lr 0.1, gamma 1: at step 1 the band is [0.05, 0.2]. With a
        // huge gradient the raw Adam step size is tiny and gets lifted to
        // the lower bound, so the update is 0.05 * m = 0.05 * 0.1 * g.
        let p = Tensor::from_vec(&[1], vec![0.0]).unwrap();
        let cfg = AdaBoundConfig { lr: 1e-3, gamma: 1.0, ..Default::default() };
        let mut opt = AdaBound::new(vec![p.clone()], cfg).unwrap();
        p.set_grad(arr1(&[100.0]).into_dyn());
        opt.step().unwrap();
        assert!((p.data()[[0]] + 0.5).abs() < 1e-4);
    }

    #[test]
    fn invalid_gamma_is_rejected() {
        let p = Tensor::from_vec(&[1], vec![0.0]).unwrap();
        let cfg = AdaBoundConfig { gamma: 0.0, ..Default::default() };
        assert!(AdaBound::new(vec![p], cfg).is_err());
    }
}
