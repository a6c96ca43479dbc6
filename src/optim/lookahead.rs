//! # Lookahead
//!
//! Keeps a set of slow weights next to the inner optimizer's fast weights.
//! Every `k` inner steps the slow weights move a fraction `alpha` towards
//! the fast weights and the fast weights are reset onto them.

use super::inner::{GroupSnapshot, InnerOptimizer};
use super::state::{StateDict, StateEntry};
use super::{validate, Optimizer, ParamKey};
use crate::error::{OptimError, Result};
use crate::tensor::{Tensor, TensorData};
use log::debug;
use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};

/// Hyperparameters for [`Lookahead`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LookaheadConfig {
    /// Number of inner steps between synchronizations.
    pub k: usize,
    /// Slow-weight interpolation factor.
    pub alpha: TensorData,
}

impl Default for LookaheadConfig {
    fn default() -> Self {
        LookaheadConfig { k: 5, alpha: 0.5 }
    }
}

impl LookaheadConfig {
    fn validate(&self) -> Result<()> {
        validate::at_least_one("k", self.k)?;
        validate::unit_interval("alpha", self.alpha)
    }
}

/// Lookahead Optimizer: k steps forward, 1 step back.
#[derive(Debug)]
pub struct Lookahead<O> {
    inner: O,
    config: LookaheadConfig,
    snapshot: GroupSnapshot,
    slow: Vec<Vec<ArrayD<TensorData>>>,
    // Inner steps since the last synchronization, per group.
    counters: Vec<usize>,
}

impl<O: Optimizer> Lookahead<O> {
    pub fn new(inner: O, config: LookaheadConfig) -> Result<Self> {
        config.validate()?;
        let snapshot = GroupSnapshot::capture(&inner);
        let slow: Vec<Vec<_>> = snapshot
            .groups()
            .iter()
            .map(|g| g.iter().map(Tensor::data_clone).collect())
            .collect();
        let counters = vec![0; slow.len()];
        Ok(Lookahead {
            inner,
            config,
            snapshot,
            slow,
            counters,
        })
    }

    pub fn from_inner(inner: InnerOptimizer<O>, config: LookaheadConfig) -> Result<Self> {
        config.validate()?;
        Self::new(inner.resolve()?, config)
    }

    pub fn with_constructor<F>(params: Vec<Tensor>, build: F, config: LookaheadConfig) -> Result<Self>
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

    pub fn slow_weights(&self, key: ParamKey) -> Option<&ArrayD<TensorData>> {
        self.slow.get(key.group)?.get(key.index)
    }

    /// `slow += alpha * (fast - slow)`, then `fast = slow`, for every
    /// parameter of group `g`.
    fn synchronize(&mut self, g: usize) {
        let alpha = self.config.alpha;
        for (param, slow) in self.snapshot.groups()[g].iter().zip(self.slow[g].iter_mut()) {
            let mut fast = param.data_mut();
            Zip::from(&mut *slow)
                .and(&*fast)
                .for_each(|s, &f| *s += alpha * (f - *s));
            fast.assign(&*slow);
        }
    }
}

impl<O: Optimizer> Optimizer for Lookahead<O> {
    fn name(&self) -> &'static str {
        "lookahead"
    }

    fn step(&mut self) -> Result<()> {
        self.snapshot.verify("lookahead", &self.inner.param_groups())?;
        self.inner.step()?;

        for g in 0..self.counters.len() {
            self.counters[g] += 1;
            if self.counters[g] >= self.config.k {
                self.synchronize(g);
                self.counters[g] = 0;
                debug!("lookahead: synchronized slow weights of group {g}");
            }
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
        for (entry, &counter) in dict.groups.iter_mut().zip(&self.counters) {
            entry.insert("counter", counter as u64);
        }
        for (g, group) in self.slow.iter().enumerate() {
            for (i, slow) in group.iter().enumerate() {
                dict.params
                    .insert(ParamKey::new(g, i), StateEntry::new().with("slow_param", slow.clone()));
            }
        }
        dict.inner = Some(Box::new(self.inner.state_dict()));
        dict
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        state.check_header(self.name(), &self.param_groups())?;

        let counters = state
            .groups
            .iter()
            .map(|entry| entry.count("counter").map(|c| c as usize))
            .collect::<Result<Vec<_>>>()?;
        let mut slow = Vec::with_capacity(self.slow.len());
        for (g, group) in self.snapshot.groups().iter().enumerate() {
            let mut restored = Vec::with_capacity(group.len());
            for (i, param) in group.iter().enumerate() {
                let key = ParamKey::new(g, i);
                let entry = state
                    .params
                    .get(&key)
                    .ok_or_else(|| OptimError::InvalidState(format!("missing slow weights for parameter {key}")))?;
                restored.push(entry.buffer("slow_param", param.shape())?);
            }
            slow.push(restored);
        }

        self.inner.load_state_dict(state.inner()?)?;
        self.counters = counters;
        self.slow = slow;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::{SGDConfig, SGD};
    use ndarray::arr1;

    fn sgd_lookahead(p: &Tensor, k: usize) -> Lookahead<SGD> {
        let sgd = SGD::new(vec![p.clone()], SGDConfig { lr: 0.1, ..Default::default() }).unwrap();
        Lookahead::new(sgd, LookaheadConfig { k, alpha: 0.5 }).unwrap()
    }

    #[test]
    fn slow_weights_only_move_at_sync_points() {
        let p = Tensor::from_vec(&[1], vec![1.0]).unwrap();
        let mut opt = sgd_lookahead(&p, 3);
        let key = ParamKey::new(0, 0);

        for _ in 0..2 {
            p.set_grad(arr1(&[1.0]).into_dyn());
            opt.step().unwrap();
            assert_eq!(opt.slow_weights(key).unwrap()[[0]], 1.0);
        }
        // fast after 3 steps would be 0.7, so both land on 0.85
        p.set_grad(arr1(&[1.0]).into_dyn());
        opt.step().unwrap();
        assert!((opt.slow_weights(key).unwrap()[[0]] - 0.85).abs() < 1e-6);
        assert!((p.data()[[0]] - 0.85).abs() < 1e-6);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let p = Tensor::from_vec(&[1], vec![1.0]).unwrap();
        let sgd = SGD::simple(vec![p.clone()], 0.1).unwrap();
        assert!(Lookahead::new(sgd, LookaheadConfig { k: 0, alpha: 0.5 }).is_err());
        let sgd = SGD::simple(vec![p], 0.1).unwrap();
        assert!(Lookahead::new(sgd, LookaheadConfig { k: 5, alpha: 1.5 }).is_err());
    }

    #[test]
    fn missing_slow_weights_fail_to_load() {
        let p = Tensor::from_vec(&[1], vec![1.0]).unwrap();
        let mut opt = sgd_lookahead(&p, 2);
        let mut dict = opt.state_dict();
        dict.params.clear();
        assert!(opt.load_state_dict(&dict).is_err());
        assert_eq!(opt.slow_weights(ParamKey::new(0, 0)).unwrap()[[0]], 1.0);
    }
}
