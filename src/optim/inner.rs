//! # Wrapped Optimizers
//!
//! Wrappers either take an already constructed optimizer, or a parameter
//! list plus a constructor that is invoked exactly once at wrap time.

use super::Optimizer;
use crate::error::{OptimError, Result};
use crate::tensor::Tensor;
use std::fmt;

type Build<O> = Box<dyn FnOnce(Vec<Tensor>) -> Result<O>>;

/// The optimizer a wrapper delegates to.
pub enum InnerOptimizer<O> {
    /// An optimizer that already owns its parameter groups.
    Bound(O),
    /// Parameters plus the constructor that binds them.
    Unbound { params: Vec<Tensor>, build: Build<O> },
}

impl<O: Optimizer> InnerOptimizer<O> {
    pub fn unbound<F>(params: Vec<Tensor>, build: F) -> Self
    where
        F: FnOnce(Vec<Tensor>) -> Result<O> + 'static,
    {
        InnerOptimizer::Unbound {
            params,
            build: Box::new(build),
        }
    }

    /// Produces the bound optimizer, running the constructor if needed.
    pub fn resolve(self) -> Result<O> {
        match self {
            InnerOptimizer::Bound(opt) => Ok(opt),
            InnerOptimizer::Unbound { params, build } => build(params),
        }
    }
}

impl<O: Optimizer> From<O> for InnerOptimizer<O> {
    fn from(opt: O) -> Self {
        InnerOptimizer::Bound(opt)
    }
}

impl<O: fmt::Debug> fmt::Debug for InnerOptimizer<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InnerOptimizer::Bound(opt) => f.debug_tuple("Bound").field(opt).finish(),
            InnerOptimizer::Unbound { params, .. } => f
                .debug_struct("Unbound")
                .field("params", &params.len())
                .finish_non_exhaustive(),
        }
    }
}

/// Parameter handles of the inner optimizer as seen at wrap time. Wrappers
/// keep per-parameter state addressed by position, so the inner groups must
/// not be reordered or resized behind their back.
#[derive(Clone, Debug)]
pub(crate) struct GroupSnapshot {
    groups: Vec<Vec<Tensor>>,
}

impl GroupSnapshot {
    pub(crate) fn capture<O: Optimizer + ?Sized>(opt: &O) -> Self {
        GroupSnapshot {
            groups: opt.param_groups().iter().map(|g| g.to_vec()).collect(),
        }
    }

    pub(crate) fn groups(&self) -> &[Vec<Tensor>] {
        &self.groups
    }

    /// Fails with `GroupMismatch` unless `current` holds the same handles in
    /// the same order.
    pub(crate) fn verify(&self, wrapper: &'static str, current: &[&[Tensor]]) -> Result<()> {
        let mismatch = |reason: String| OptimError::GroupMismatch { wrapper, reason };
        if current.len() != self.groups.len() {
            return Err(mismatch(format!(
                "expected {} groups, found {}",
                self.groups.len(),
                current.len()
            )));
        }
        for (g, (known, live)) in self.groups.iter().zip(current).enumerate() {
            if known.len() != live.len() {
                return Err(mismatch(format!(
                    "group {g} had {} parameters, now {}",
                    known.len(),
                    live.len()
                )));
            }
            if let Some(i) = known.iter().zip(live.iter()).position(|(a, b)| !a.same_as(b)) {
                return Err(mismatch(format!("parameter {g}.{i} was replaced")));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::{SGDConfig, SGD};
    use crate::tensor::zeros;

    #[test]
    fn unbound_constructor_runs_once_on_resolve() {
        let params = vec![zeros(&[2], true)];
        let inner = InnerOptimizer::unbound(params.clone(), |p| SGD::new(p, SGDConfig::default()));
        let opt = inner.resolve().unwrap();
        assert!(opt.param_groups()[0][0].same_as(&params[0]));
    }

    #[test]
    fn snapshot_detects_replaced_parameters() {
        let a = zeros(&[1], true);
        let b = zeros(&[1], true);
        let opt = SGD::new(vec![a.clone(), b.clone()], SGDConfig::default()).unwrap();
        let snapshot = GroupSnapshot::capture(&opt);
        assert!(snapshot.verify("test", &opt.param_groups()).is_ok());

        let swapped = [b.clone(), a.clone()];
        let err = snapshot.verify("test", &[&swapped[..]]).unwrap_err();
        assert!(matches!(err, OptimError::GroupMismatch { wrapper: "test", .. }));
        assert!(snapshot.verify("test", &[&swapped[..1]]).is_err());
    }
}
