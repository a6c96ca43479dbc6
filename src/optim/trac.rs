//! # TRAC
//!
//! Parameter-free trust-region wrapper. The inner optimizer proposes an
//! update; TRAC then places the parameters at `theta_ref + S * delta`, where
//! `delta` accumulates the proposed displacements and `S` is tuned online
//! from how well past displacements agreed with the observed gradients.
//! Disagreement shrinks `S`, pulling the parameters back towards the
//! reference point captured at wrap time.
//!
//! Parameters the inner rule skips (frozen, no gradient, or a non-finite
//! gradient) are neither moved nor counted in the statistics.
//!
//! All statistics are kept in `f64`.

use super::inner::{GroupSnapshot, InnerOptimizer};
use super::state::{ParamState, StateDict, StateEntry};
use super::{checked_grad, ensure_grad_shapes, Optimizer, ParamKey};
use crate::error::{OptimError, Result};
use crate::tensor::{ops, Tensor, TensorData};
use log::warn;
use ndarray::{ArrayD, IxDyn, Zip};
use serde::{Deserialize, Serialize};
use std::f64::consts::{FRAC_1_SQRT_2, PI};

const ERFI_MAX_TERMS: usize = 4096;

/// Imaginary error function `erfi(x) = -i erf(ix)`, by its Taylor series
/// `2/sqrt(pi) * sum x^(2n+1) / (n! (2n+1))`. Overflows to infinity for
/// large `|x|`.
pub fn erfi(x: f64) -> f64 {
    let x2 = x * x;
    let mut term = x;
    let mut sum = x;
    for n in 1..ERFI_MAX_TERMS {
        term *= x2 / n as f64;
        let contribution = term / (2 * n + 1) as f64;
        sum += contribution;
        if contribution.abs() <= 1e-16 * sum.abs() || !sum.is_finite() {
            break;
        }
    }
    2.0 / PI.sqrt() * sum
}

/// Hyperparameters for [`TRAC`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TRACConfig {
    /// Discount factors, one scale component each.
    pub betas: Vec<f64>,
    /// Initial scale of each component.
    pub s_prev: f64,
    pub eps: f64,
}

impl Default for TRACConfig {
    fn default() -> Self {
        TRACConfig {
            betas: vec![0.9, 0.99, 0.999, 0.9999, 0.99999, 0.999999],
            s_prev: 1e-8,
            eps: 1e-8,
        }
    }
}

impl TRACConfig {
    fn validate(&self) -> Result<()> {
        let invalid = |name, value, expected| OptimError::InvalidHyperparameter { name, value, expected };
        if self.betas.is_empty() {
            return Err(invalid("betas", 0.0, "at least one discount factor"));
        }
        if let Some(&beta) = self.betas.iter().find(|&&b| !(0.0 <= b && b < 1.0)) {
            return Err(invalid("beta", beta, "in [0, 1)"));
        }
        if !(0.0 < self.s_prev) {
            return Err(invalid("s_prev", self.s_prev, "> 0"));
        }
        if !(0.0 <= self.eps) {
            return Err(invalid("epsilon", self.eps, ">= 0"));
        }
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct TRACGroupState {
    s: Vec<f64>,
    variance: Vec<f64>,
    sigma: Vec<f64>,
}

impl TRACGroupState {
    fn new(config: &TRACConfig) -> Self {
        let n = config.betas.len();
        TRACGroupState {
            s: vec![0.0; n],
            variance: vec![0.0; n],
            sigma: vec![config.s_prev; n],
        }
    }

    fn scale(&self) -> f64 {
        self.s.iter().sum()
    }

    fn to_entry(&self) -> StateEntry {
        StateEntry::new()
            .with("s", self.s.clone())
            .with("variance", self.variance.clone())
            .with("sigma", self.sigma.clone())
    }

    fn from_entry(entry: &StateEntry, n: usize) -> Result<Self> {
        Ok(TRACGroupState {
            s: entry.vector("s", n)?,
            variance: entry.vector("variance", n)?,
            sigma: entry.vector("sigma", n)?,
        })
    }
}

#[derive(Clone, Debug)]
struct TRACParamState {
    theta_ref: ArrayD<TensorData>,
    // `theta - theta_ref` as last written by TRAC. Kept as state: with
    // scales near `s_prev` the difference is below the resolution of
    // single-precision parameters.
    displacement: ArrayD<TensorData>,
}

impl ParamState for TRACParamState {
    fn to_entry(&self) -> StateEntry {
        StateEntry::new()
            .with("theta_ref", self.theta_ref.clone())
            .with("displacement", self.displacement.clone())
    }

    fn from_entry(entry: &StateEntry, shape: &[usize]) -> Result<Self> {
        Ok(TRACParamState {
            theta_ref: entry.buffer("theta_ref", shape)?,
            displacement: entry.buffer("displacement", shape)?,
        })
    }
}

/// TRAC: Adaptive Parameter-free Optimization.
#[derive(Debug)]
pub struct TRAC<O> {
    inner: O,
    config: TRACConfig,
    snapshot: GroupSnapshot,
    params: Vec<Vec<TRACParamState>>,
    groups: Vec<TRACGroupState>,
}

impl<O: Optimizer> TRAC<O> {
    pub fn new(inner: O, config: TRACConfig) -> Result<Self> {
        config.validate()?;
        let snapshot = GroupSnapshot::capture(&inner);
        let params: Vec<Vec<_>> = snapshot
            .groups()
            .iter()
            .map(|g| {
                g.iter()
                    .map(|p| TRACParamState {
                        theta_ref: p.data_clone(),
                        displacement: ArrayD::zeros(IxDyn(p.shape())),
                    })
                    .collect()
            })
            .collect();
        let groups = vec![TRACGroupState::new(&config); params.len()];
        Ok(TRAC {
            inner,
            config,
            snapshot,
            params,
            groups,
        })
    }

    pub fn from_inner(inner: InnerOptimizer<O>, config: TRACConfig) -> Result<Self> {
        config.validate()?;
        Self::new(inner.resolve()?, config)
    }

    pub fn with_constructor<F>(params: Vec<Tensor>, build: F, config: TRACConfig) -> Result<Self>
    where
        F: FnOnce(Vec<Tensor>) -> Result<O> + 'static,
    {
        Self::from_inner(InnerOptimizer::unbound(params, build), config)
    }

    pub fn inner(&self) -> &O {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut O {
        &mut self.inner
    }

    /// Current scale `S = sum(s)` of group `group`.
    pub fn scale(&self, group: usize) -> Option<f64> {
        self.groups.get(group).map(TRACGroupState::scale)
    }

    fn update_statistics(&self, stats: &mut TRACGroupState, h: f64, g: usize) {
        let mut next_s = Vec::with_capacity(stats.s.len());
        for (j, &beta) in self.config.betas.iter().enumerate() {
            stats.variance[j] = beta * beta * stats.variance[j] + h * h;
            stats.sigma[j] = beta * stats.sigma[j] - h;
            let arg = stats.sigma[j] / ((2.0 * stats.variance[j]).sqrt() + self.config.eps);
            next_s.push(self.config.s_prev / erfi(FRAC_1_SQRT_2) * erfi(arg));
        }
        if next_s.iter().all(|s| s.is_finite()) {
            stats.s = next_s;
        } else {
            warn!("trac: non-finite scale in group {g}; keeping the previous scale");
        }
    }
}

impl<O: Optimizer> Optimizer for TRAC<O> {
    fn name(&self) -> &'static str {
        "trac"
    }

    fn step(&mut self) -> Result<()> {
        let groups = self.inner.param_groups();
        self.snapshot.verify("trac", &groups)?;
        ensure_grad_shapes(&groups)?;

        // --- Snapshot before the inner rule moves anything ---
        // Parameters the inner rule skips keep their TRAC state and values.
        let mut before = Vec::with_capacity(self.params.len());
        for (g, group) in self.snapshot.groups().iter().enumerate() {
            let mut taken = Vec::with_capacity(group.len());
            for (i, param) in group.iter().enumerate() {
                let grad = checked_grad(param, ParamKey::new(g, i))?.filter(|grad| ops::all_finite(grad));
                taken.push(grad.map(|grad| (param.data_clone(), grad)));
            }
            before.push(taken);
        }

        self.inner.step()?;

        for g in 0..self.groups.len() {
            let mut stats = self.groups[g].clone();
            let denom = stats.scale() + self.config.eps;

            let mut h = 0.0;
            let mut deltas = Vec::with_capacity(self.params[g].len());
            for (i, param) in self.snapshot.groups()[g].iter().enumerate() {
                let (theta, grad) = match &before[g][i] {
                    Some(taken) => taken,
                    None => {
                        deltas.push(None);
                        continue;
                    }
                };
                // (theta - theta_ref) / (S + eps)
                let mut delta = if denom > 0.0 {
                    self.params[g][i]
                        .displacement
                        .mapv(|d| (d as f64 / denom) as TensorData)
                } else {
                    ArrayD::zeros(IxDyn(param.shape()))
                };
                h += Zip::from(&delta)
                    .and(grad)
                    .fold(0.0, |acc, &d, &gr| acc + d as f64 * gr as f64);
                Zip::from(&mut delta)
                    .and(&*param.data())
                    .and(theta)
                    .for_each(|d, &new, &old| *d += new - old);
                deltas.push(Some(delta));
            }

            self.update_statistics(&mut stats, h, g);
            let scale = stats.scale().max(0.0);
            for ((param, state), delta) in self.snapshot.groups()[g]
                .iter()
                .zip(self.params[g].iter_mut())
                .zip(deltas)
            {
                let delta = match delta {
                    Some(delta) => delta,
                    None => continue,
                };
                state.displacement = delta.mapv(|d| (scale * d as f64) as TensorData);
                let mut data = param.data_mut();
                Zip::from(&mut *data)
                    .and(&state.theta_ref)
                    .and(&state.displacement)
                    .for_each(|p, &r, &d| *p = r + d);
            }
            self.groups[g] = stats;
        }
        Ok(())
    }

    fn param_groups(&self) -> Vec<&[Tensor]> {
        self.inner.param_groups()
    }

    fn learning_rate(&self) -> f32 {
        self.inner.learning_rate()
    }

    fn state_dict(&self) -> StateDict {
        let mut dict = StateDict::new(self.name(), &self.param_groups());
        for (entry, stats) in dict.groups.iter_mut().zip(&self.groups) {
            *entry = stats.to_entry();
        }
        for (g, group) in self.params.iter().enumerate() {
            for (i, state) in group.iter().enumerate() {
                dict.params.insert(ParamKey::new(g, i), state.to_entry());
            }
        }
        dict.inner = Some(Box::new(self.inner.state_dict()));
        dict
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        state.check_header(self.name(), &self.param_groups())?;

        let n = self.config.betas.len();
        let groups = state
            .groups
            .iter()
            .map(|entry| TRACGroupState::from_entry(entry, n))
            .collect::<Result<Vec<_>>>()?;
        let mut params = Vec::with_capacity(self.params.len());
        for (g, group) in self.snapshot.groups().iter().enumerate() {
            let mut restored = Vec::with_capacity(group.len());
            for (i, param) in group.iter().enumerate() {
                let key = ParamKey::new(g, i);
                let entry = state
                    .params
                    .get(&key)
                    .ok_or_else(|| OptimError::InvalidState(format!("missing reference point for parameter {key}")))?;
                let decoded = TRACParamState::from_entry(entry, param.shape())
                    .map_err(|e| OptimError::InvalidState(format!("parameter {key}: {e}")))?;
                restored.push(decoded);
            }
            params.push(restored);
        }

        self.inner.load_state_dict(state.inner()?)?;
        self.groups = groups;
        self.params = params;
        Ok(())
    }
}
