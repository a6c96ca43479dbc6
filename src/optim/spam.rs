//! # SPAM Optimizer
//!
//! Spike-Aware Adam with Momentum Reset. Two safeguards sit on top of Adam:
//!
//! - gradient spikes, elements whose square exceeds `threshold` times the
//!   running second moment, are clipped to that bound (sign preserved) before
//!   the moments are updated;
//! - every `update_proj_gap` steps both moments are zeroed to purge stale
//!   spike-influenced state, and the learning rate is warmed back up over
//!   `warmup_epoch` steps with a cosine ramp.
//!
//! With `density < 1`, 2-D parameters are only updated on a random subset of
//! their elements, redrawn at every reset.

use super::cautious::cautious;
use super::functional::bias_correction;
use super::state::{export_params, import_params, ParamState, StateDict, StateEntry};
use super::{build_groups, ensure_grad_shapes, first_lr, group_slices, push_group, validate};
use super::{GradientCheck, GroupConfig, Optimizer, ParamGroup, ParamKey};
use crate::error::{OptimError, Result};
use crate::tensor::{ops, Tensor, TensorData};
use log::debug;
use ndarray::{Array1, ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;

/// Fraction of the learning rate withheld right after a momentum reset.
const RESET_DEATH_RATE: f64 = 0.99;

/// Hyperparameters for [`SPAM`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SPAMConfig {
    pub lr: TensorData,
    pub betas: (TensorData, TensorData),
    /// Fraction of elements of 2-D parameters that are updated.
    pub density: TensorData,
    pub weight_decay: TensorData,
    /// Length of the learning-rate warm-up after each momentum reset.
    pub warmup_epoch: u64,
    /// Spike threshold, relative to the second moment. 0 disables clipping.
    pub threshold: TensorData,
    /// Steps after a reset before spike clipping is active again.
    pub grad_accu_steps: u64,
    /// Momentum reset period. 0 disables resets.
    pub update_proj_gap: u64,
    pub eps: TensorData,
    pub cautious: bool,
    /// Seed for the sparse update masks.
    pub seed: u64,
}

impl Default for SPAMConfig {
    fn default() -> Self {
        SPAMConfig {
            lr: 1e-3,
            betas: (0.9, 0.999),
            density: 1.0,
            weight_decay: 0.0,
            warmup_epoch: 50,
            threshold: 5000.0,
            grad_accu_steps: 20,
            update_proj_gap: 500,
            eps: 1e-6,
            cautious: false,
            seed: 42,
        }
    }
}

impl GroupConfig for SPAMConfig {
    fn learning_rate(&self) -> f32 {
        self.lr
    }

    fn validate(&self) -> Result<()> {
        validate::learning_rate(self.lr)?;
        validate::betas(self.betas)?;
        validate::positive("density", self.density)?;
        validate::unit_interval("density", self.density)?;
        validate::non_negative("weight_decay", self.weight_decay)?;
        validate::non_negative("threshold", self.threshold)?;
        validate::non_negative("epsilon", self.eps)
    }
}

impl SPAMConfig {
    /// Whether spike clipping applies at global step `t` (1-based).
    fn clips_spikes(&self, t: u64) -> bool {
        self.threshold > 0.0
            && t >= self.grad_accu_steps
            && (self.update_proj_gap == 0 || t % self.update_proj_gap >= self.grad_accu_steps)
    }

    fn is_reset_boundary(&self, t: u64) -> bool {
        self.update_proj_gap > 0 && t % self.update_proj_gap == 0
    }

    fn masks(&self, shape: &[usize]) -> bool {
        self.density < 1.0 && shape.len() == 2
    }
}

/// Learning-rate multiplier `w` steps after a reset: a cosine ramp from
/// `1 - RESET_DEATH_RATE` up to 1 over `warmup` steps.
fn warmup_scale(w: u64, warmup: u64) -> TensorData {
    if warmup == 0 || w >= warmup {
        return 1.0;
    }
    let progress = w as f64 / warmup as f64;
    (1.0 - RESET_DEATH_RATE * 0.5 * (1.0 + (PI * progress).cos())) as TensorData
}

/// Row-major positions selected by a Bernoulli(`density`) draw. The draw is
/// a pure function of its inputs so checkpoints do not need RNG state.
fn draw_mask(numel: usize, density: TensorData, seed: u64, generation: u64, key: ParamKey) -> Vec<usize> {
    let param_id = ((key.group as u64) << 32) | key.index as u64;
    let mixed = seed
        ^ generation.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ param_id.wrapping_mul(0xBF58_476D_1CE4_E5B9);
    let mut rng = StdRng::seed_from_u64(mixed);
    (0..numel).filter(|_| rng.gen_bool(density as f64)).collect()
}

#[derive(Clone, Debug)]
struct SPAMParamState {
    step: u64,
    // Shaped like the parameter, or flat over the mask when one is set.
    exp_avg: ArrayD<TensorData>,
    exp_avg_sq: ArrayD<TensorData>,
    mask: Option<Vec<usize>>,
}

impl SPAMParamState {
    fn new(shape: &[usize], cfg: &SPAMConfig, key: ParamKey, generation: u64) -> Self {
        let mut state = SPAMParamState {
            step: 0,
            exp_avg: ArrayD::zeros(IxDyn(&[0])),
            exp_avg_sq: ArrayD::zeros(IxDyn(&[0])),
            mask: None,
        };
        state.reset(shape, cfg, key, generation);
        state
    }

    /// Zeroes both moments and, for masked parameters, draws a new mask.
    fn reset(&mut self, shape: &[usize], cfg: &SPAMConfig, key: ParamKey, generation: u64) {
        let moment_shape = if cfg.masks(shape) {
            let numel = shape.iter().product();
            let mask = draw_mask(numel, cfg.density, cfg.seed, generation, key);
            let len = mask.len();
            self.mask = Some(mask);
            vec![len]
        } else {
            self.mask = None;
            shape.to_vec()
        };
        self.exp_avg = ArrayD::zeros(IxDyn(&moment_shape));
        self.exp_avg_sq = ArrayD::zeros(IxDyn(&moment_shape));
    }
}

impl ParamState for SPAMParamState {
    fn to_entry(&self) -> StateEntry {
        let mut entry = StateEntry::new()
            .with("step", self.step)
            .with("exp_avg", self.exp_avg.clone())
            .with("exp_avg_sq", self.exp_avg_sq.clone());
        if let Some(mask) = &self.mask {
            entry.insert("mask", mask.clone());
        }
        entry
    }

    fn from_entry(entry: &StateEntry, shape: &[usize]) -> Result<Self> {
        let mask = if entry.contains("mask") {
            let mask = entry.indices("mask")?;
            let numel: usize = shape.iter().product();
            let increasing = mask.windows(2).all(|w| w[0] < w[1]);
            if !increasing || mask.last().map_or(false, |&last| last >= numel) {
                return Err(OptimError::InvalidState("mask indices out of range".into()));
            }
            Some(mask)
        } else {
            None
        };
        let moment_shape = match &mask {
            Some(m) => vec![m.len()],
            None => shape.to_vec(),
        };
        Ok(SPAMParamState {
            step: entry.count("step")?,
            exp_avg: entry.buffer("exp_avg", &moment_shape)?,
            exp_avg_sq: entry.buffer("exp_avg_sq", &moment_shape)?,
            mask,
        })
    }
}

/// SPAM: Spike-Aware Adam with Momentum Reset for Stable LLM Training.
#[derive(Debug)]
pub struct SPAM {
    groups: Vec<ParamGroup<SPAMConfig>>,
    state: BTreeMap<ParamKey, SPAMParamState>,
    grads: GradientCheck,
    total_step: u64,
    // Steps since the last reset, per group.
    warmup: Vec<u64>,
}

impl SPAM {
    pub fn new<I>(params: I, config: SPAMConfig) -> Result<Self>
    where
        I: IntoIterator<Item = Tensor>,
    {
        Self::with_groups(vec![ParamGroup::new(params, config)])
    }

    pub fn with_groups(groups: Vec<ParamGroup<SPAMConfig>>) -> Result<Self> {
        let groups = build_groups(groups)?;
        let warmup = groups.iter().map(|g| g.config.warmup_epoch).collect();
        Ok(SPAM {
            groups,
            state: BTreeMap::new(),
            grads: GradientCheck::default(),
            total_step: 0,
            warmup,
        })
    }

    pub fn add_param_group(&mut self, group: ParamGroup<SPAMConfig>) -> Result<()> {
        let warmup = group.config.warmup_epoch;
        push_group(&mut self.groups, group)?;
        self.warmup.push(warmup);
        Ok(())
    }

    /// Number of completed steps.
    pub fn total_step(&self) -> u64 {
        self.total_step
    }

    fn update_param(
        cfg: &SPAMConfig,
        state: &mut SPAMParamState,
        param: &Tensor,
        grad: &ArrayD<TensorData>,
        clip_spikes: bool,
        lr_scale: TensorData,
    ) -> Result<()> {
        let (beta1, beta2) = cfg.betas;
        state.step += 1;

        let mut grad = match &state.mask {
            Some(mask) => ops::gather(grad, mask),
            None => ops::flatten(grad),
        };

        // --- Spike clipping, against the second moment before this step ---
        if clip_spikes {
            for (g, &v) in grad.iter_mut().zip(state.exp_avg_sq.iter()) {
                let limit = cfg.threshold * v;
                if *g * *g > limit {
                    *g = g.signum() * limit.sqrt();
                }
            }
        }

        for ((m, v), &g) in state
            .exp_avg
            .iter_mut()
            .zip(state.exp_avg_sq.iter_mut())
            .zip(grad.iter())
        {
            *m = beta1 * *m + (1.0 - beta1) * g;
            *v = beta2 * *v + (1.0 - beta2) * g * g;
        }

        let bias_correction1 = bias_correction(beta1, state.step);
        let bias_correction2 = bias_correction(beta2, state.step);
        let step_size = cfg.lr * lr_scale / bias_correction1;

        let exp_avg = ops::flatten(&state.exp_avg);
        let exp_avg = if cfg.cautious { cautious(exp_avg, &grad) } else { exp_avg };
        let update: Array1<TensorData> = exp_avg
            .iter()
            .zip(state.exp_avg_sq.iter())
            .map(|(&m, &v)| m / ((v / bias_correction2).sqrt() + cfg.eps))
            .collect();

        let mut data = param.data_mut();
        let mut flat = ops::flat_mut(&mut data)?;
        match &state.mask {
            Some(mask) => {
                for (&j, &u) in mask.iter().zip(update.iter()) {
                    flat[j] -= step_size * u;
                }
            }
            None => {
                for (p, &u) in flat.iter_mut().zip(update.iter()) {
                    *p -= step_size * u;
                }
            }
        }
        if cfg.weight_decay > 0.0 {
            let factor = 1.0 - cfg.lr * cfg.weight_decay;
            flat.mapv_inplace(|p| p * factor);
        }
        Ok(())
    }
}

impl Optimizer for SPAM {
    fn name(&self) -> &'static str {
        "spam"
    }

    fn step(&mut self) -> Result<()> {
        ensure_grad_shapes(&group_slices(&self.groups))?;
        self.total_step += 1;
        let t = self.total_step;

        for (g, group) in self.groups.iter().enumerate() {
            let cfg = &group.config;
            let lr_scale = warmup_scale(self.warmup[g], cfg.warmup_epoch);
            let clip_spikes = cfg.clips_spikes(t);
            let generation = if cfg.update_proj_gap > 0 { (t - 1) / cfg.update_proj_gap } else { 0 };

            for (i, param) in group.params.iter().enumerate() {
                let key = ParamKey::new(g, i);
                let grad = match self.grads.read(param, key)? {
                    Some(grad) => grad,
                    None => continue,
                };
                let state = self
                    .state
                    .entry(key)
                    .or_insert_with(|| SPAMParamState::new(param.shape(), cfg, key, generation));
                Self::update_param(cfg, state, param, &grad, clip_spikes, lr_scale)?;
            }

            if cfg.is_reset_boundary(t) {
                let range = ParamKey::new(g, 0)..ParamKey::new(g + 1, 0);
                for (key, state) in self.state.range_mut(range) {
                    state.reset(group.params[key.index].shape(), cfg, *key, t / cfg.update_proj_gap);
                }
                self.warmup[g] = 0;
                debug!("spam: reset moments of group {g} at step {t}");
            } else {
                self.warmup[g] = self.warmup[g].saturating_add(1);
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
        dict.globals.insert("total_step", self.total_step);
        for (entry, &w) in dict.groups.iter_mut().zip(&self.warmup) {
            entry.insert("warmup_step", w);
        }
        export_params(&mut dict, &self.state);
        dict
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        let groups = self.param_groups();
        state.check_header(self.name(), &groups)?;
        let restored = import_params(state, &groups)?;
        let total_step = state.globals.count("total_step")?;
        let warmup = state
            .groups
            .iter()
            .map(|entry| entry.count("warmup_step"))
            .collect::<Result<Vec<_>>>()?;

        self.state = restored;
        self.total_step = total_step;
        self.warmup = warmup;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array2};

    fn no_clip() -> SPAMConfig {
        SPAMConfig { threshold: 0.0, ..Default::default() }
    }

    #[test]
    fn warmup_ramps_from_one_percent() {
        assert!((warmup_scale(0, 10) - 0.01).abs() < 1e-6);
        assert!(warmup_scale(5, 10) > 0.01 && warmup_scale(5, 10) < 1.0);
        assert_eq!(warmup_scale(10, 10), 1.0);
        assert_eq!(warmup_scale(3, 0), 1.0);
    }

    #[test]
    fn spike_window_follows_the_reset_period() {
        let cfg = SPAMConfig { grad_accu_steps: 2, update_proj_gap: 5, ..Default::default() };
        let active: Vec<u64> = (1..=10).filter(|&t| cfg.clips_spikes(t)).collect();
        assert_eq!(active, vec![2, 3, 4, 7, 8, 9]);
    }

    #[test]
    fn masks_are_deterministic() {
        let key = ParamKey::new(0, 1);
        assert_eq!(draw_mask(100, 0.3, 7, 2, key), draw_mask(100, 0.3, 7, 2, key));
        assert_ne!(draw_mask(100, 0.3, 7, 2, key), draw_mask(100, 0.3, 7, 3, key));
        assert_eq!(draw_mask(10, 1.0, 7, 0, key).len(), 10);
    }

    #[test]
    fn sparse_density_updates_only_masked_elements() {
        let matrix = Tensor::new(Array2::<f32>::zeros((10, 10)).into_dyn(), true);
        let vector = Tensor::from_vec(&[4], vec![0.0; 4]).unwrap();
        let cfg = SPAMConfig { density: 0.3, lr: 0.1, ..no_clip() };
        let mut opt = SPAM::new(vec![matrix.clone(), vector.clone()], cfg).unwrap();

        matrix.set_grad(ArrayD::ones(IxDyn(&[10, 10])));
        vector.set_grad(ArrayD::ones(IxDyn(&[4])));
        opt.step().unwrap();

        let dict = opt.state_dict();
        let mask = dict.params[&ParamKey::new(0, 0)].indices("mask").unwrap();
        let changed = matrix.data().iter().filter(|&&v| v != 0.0).count();
        assert_eq!(changed, mask.len());
        assert!(!dict.params[&ParamKey::new(0, 1)].contains("mask"));
        assert!(vector.data().iter().all(|&v| v < 0.0));
    }

    #[test]
    fn reset_boundary_zeroes_moments_and_restarts_warmup() {
        let p = Tensor::from_vec(&[2], vec![0.0, 0.0]).unwrap();
        let cfg = SPAMConfig { update_proj_gap: 3, warmup_epoch: 4, ..no_clip() };
        let mut opt = SPAM::new(vec![p.clone()], cfg).unwrap();
        p.set_grad(arr1(&[1.0, -1.0]).into_dyn());

        opt.step().unwrap();
        opt.step().unwrap();
        let key = ParamKey::new(0, 0);
        let m = opt.state_dict().params[&key].buffer("exp_avg", &[2]).unwrap();
        assert!(m.iter().all(|&v| v != 0.0));

        opt.step().unwrap();
        let dict = opt.state_dict();
        assert!(dict.params[&key].buffer("exp_avg", &[2]).unwrap().iter().all(|&v| v == 0.0));
        assert!(dict.params[&key].buffer("exp_avg_sq", &[2]).unwrap().iter().all(|&v| v == 0.0));
        assert_eq!(dict.groups[0].count("warmup_step").unwrap(), 0);

        // first step after the reset runs at 1% of the learning rate; the
        // step counter keeps running, so bias correction uses t = 4
        let before = p.data_clone();
        opt.step().unwrap();
        let moved = (p.data()[[0]] - before[[0]]).abs();
        let m_hat = 0.1 / bias_correction(0.9, 4);
        let v_hat = 1e-3 / bias_correction(0.999, 4);
        let expected = 1e-3 * 0.01 * m_hat / (v_hat.sqrt() + 1e-6);
        assert!((moved - expected).abs() < 1e-8);
    }
}
