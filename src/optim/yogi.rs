//! # Yogi Optimizer

use super::functional::{apply_weight_decay, bias_correction, ema};
use super::state::{export_params, import_params, ParamState, StateDict, StateEntry};
use super::{build_groups, ensure_grad_shapes, first_lr, group_slices, push_group, validate};
use super::{GradientCheck, GroupConfig, Optimizer, ParamGroup, ParamKey};
use crate::error::Result;
use crate::tensor::{Tensor, TensorData};
use ndarray::{ArrayD, IxDyn, Zip};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Hyperparameters for [`Yogi`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct YogiConfig {
    pub lr: TensorData,
    pub betas: (TensorData, TensorData),
    /// Initial value of both moment estimates.
    pub initial_accumulator: TensorData,
    pub weight_decay: TensorData,
    pub weight_decouple: bool,
    pub fixed_decay: bool,
    pub adam_debias: bool,
    pub eps: TensorData,
}

impl Default for YogiConfig {
    fn default() -> Self {
        YogiConfig {
            lr: 1e-2,
            betas: (0.9, 0.999),
            initial_accumulator: 1e-6,
            weight_decay: 0.0,
            weight_decouple: true,
            fixed_decay: false,
            adam_debias: false,
            eps: 1e-3,
        }
    }
}

impl GroupConfig for YogiConfig {
    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn validate(&self) -> Result<()> {
        validate::learning_rate(self.lr)?;
        validate::betas(self.betas)?;
        validate::non_negative("initial_accumulator", self.initial_accumulator)?;
        validate::non_negative("weight_decay", self.weight_decay)?;
        validate::non_negative("epsilon", self.eps)
    }
}

#[derive(Clone, Debug)]
struct YogiParamState {
    step: u64,
    exp_avg: ArrayD<TensorData>,
    exp_avg_sq: ArrayD<TensorData>,
}

impl ParamState for YogiParamState {
    fn to_entry(&self) -> StateEntry {
        StateEntry::new()
            .with("step", self.step)
            .with("exp_avg", self.exp_avg.clone())
            .with("exp_avg_sq", self.exp_avg_sq.clone())
    }

    fn from_entry(entry: &StateEntry, shape: &[usize]) -> Result<Self> {
        Ok(YogiParamState {
            step: entry.count("step")?,
            exp_avg: entry.buffer("exp_avg", shape)?,
            exp_avg_sq: entry.buffer("exp_avg_sq", shape)?,
        })
    }
}

/// Yogi: Adam with an additive second-moment update,
/// `v -= (1 - beta2) * sign(v - g^2) * g^2`, which keeps the effective
/// learning rate from growing abruptly when gradients become sparse.
#[derive(Debug)]
pub struct Yogi {
    groups: Vec<ParamGroup<YogiConfig>>,
    state: BTreeMap<ParamKey, YogiParamState>,
    grads: GradientCheck,
}

impl Yogi {
    pub fn new<I>(params: I, config: YogiConfig) -> Result<Self>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Self::with_groups(vec![ParamGroup::new(params, config)])
    }

    pub fn with_groups(groups: Vec<ParamGroup<YogiConfig>>) -> Result<Self> {
        Ok(Yogi {
            groups: build_groups(groups)?,
            state: BTreeMap::new(),
            grads: GradientCheck::default(),
        })
    }

    pub fn add_param_group(&mut self, group: ParamGroup<YogiConfig>) -> Result<()> {
        push_group(&mut self.groups, group)
    }
}

impl Optimizer for Yogi {
    fn name(&self) -> &'static str {
        "yogi"
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

                let state = self.state.entry(key).or_insert_with(|| YogiParamState {
                    step: 0,
                    exp_avg: ArrayD::from_elem(IxDyn(param.shape()), cfg.initial_accumulator),
                    exp_avg_sq: ArrayD::from_elem(IxDyn(param.shape()), cfg.initial_accumulator),
                });
                state.step += 1;

                let bias_correction2_sq = bias_correction(beta2, state.step).sqrt();
                let step_size = if cfg.adam_debias {
                    cfg.lr
                } else {
                    cfg.lr / bias_correction(beta1, state.step)
                };

                apply_weight_decay(&mut data, &mut grad, cfg.lr, cfg.weight_decay, cfg.weight_decouple, cfg.fixed_decay);

                ema(&mut state.exp_avg, &grad, beta1);
                Zip::from(&mut state.exp_avg_sq).and(&grad).for_each(|v, &g| {
                    let g2 = g * g;
                    let sign = if *v > g2 {
                        1.0
                    } else if *v < g2 {
                        -1.0
                    } else {
                        0.0
                    };
                    *v -= (1.0 - beta2) * sign * g2;
                });

                Zip::from(&mut *data)
                    .and(&state.exp_avg)
                    .and(&state.exp_avg_sq)
                    .for_each(|p, &m, &v| {
                        let de_nom = v.sqrt() / bias_correction2_sq + cfg.eps;
                        *p -= step_size * m / de_nom;
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
    fn second_moment_moves_additively() {
        let p = Tensor::from_vec(&[1], vec![0.0]).unwrap();
        let cfg = YogiConfig { initial_accumulator: 0.0, ..Default::default() };
        let mut opt = Yogi::new(vec![p.clone()], cfg).unwrap();
        p.set_grad(arr1(&[2.0]).into_dyn());
        opt.step().unwrap();

        // v = 0 - 0.001 * sign(0 - 4) * 4 = 0.004
        let dict = opt.state_dict();
        let v = dict.params[&ParamKey::new(0, 0)].buffer("exp_avg_sq", &[1]).unwrap();
        assert!((v[[0]] - 0.004).abs() < 1e-7);
        assert!(p.data()[[0]] < 0.0);
    }
}
