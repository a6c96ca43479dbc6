//! # OrthoGrad
//!
//! Gradient-transform wrapper: before delegating to the inner optimizer,
//! each gradient is replaced by its component orthogonal to the parameter
//! vector, rescaled to the original gradient norm. Removing the radial
//! component keeps the update from simply growing or shrinking the weights.

use super::inner::{GroupSnapshot, InnerOptimizer};
use super::state::StateDict;
use super::{ensure_grad_shapes, validate, Optimizer};
use crate::error::Result;
use crate::tensor::{ops, Tensor, TensorData};
use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};

/// Hyperparameters for [`OrthoGrad`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrthoGradConfig {
    /// Guards the projection and rescale divisions.
    pub eps: f64,
}

impl Default for OrthoGradConfig {
    fn default() -> Self {
        OrthoGradConfig { eps: 1e-30 }
    }
}

impl OrthoGradConfig {
    fn validate(&self) -> Result<()> {
        validate::non_negative("epsilon", self.eps as f32)
    }
}

/// `g - (p·g / (p·p + eps)) p`, rescaled to `||g||`.
pub fn orthogonalize(param: &ArrayD<TensorData>, grad: &ArrayD<TensorData>, eps: f64) -> ArrayD<TensorData> {
    let proj = ops::dot(param, grad) / (ops::dot(param, param) + eps);
    let ortho: ArrayD<f64> = Zip::from(grad)
        .and(param)
        .map_collect(|&g, &p| g as f64 - proj * p as f64);

    let grad_norm = ops::norm(grad);
    let ortho_norm = ortho.iter().map(|v| v * v).sum::<f64>().sqrt();
    let scale = grad_norm / (ortho_norm + eps);
    ortho.mapv(|v| (v * scale) as TensorData)
}

/// Orthogonalizes gradients in place, then steps the wrapped optimizer.
#[derive(Debug)]
pub struct OrthoGrad<O> {
    inner: O,
    config: OrthoGradConfig,
    snapshot: GroupSnapshot,
}

impl<O: Optimizer> OrthoGrad<O> {
    pub fn new(inner: O, config: OrthoGradConfig) -> Result<Self> {
        config.validate()?;
        let snapshot = GroupSnapshot::capture(&inner);
        Ok(OrthoGrad {
            inner,
            config,
            snapshot,
        })
    }

    pub fn from_inner(inner: InnerOptimizer<O>, config: OrthoGradConfig) -> Result<Self> {
        config.validate()?;
        Self::new(inner.resolve()?, config)
    }

    pub fn with_constructor<F>(params: Vec<Tensor>, build: F, config: OrthoGradConfig) -> Result<Self>
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

    pub fn into_inner(self) -> O {
        self.inner
    }

    fn transform_gradients(&self) -> Result<()> {
        let groups = self.inner.param_groups();
        self.snapshot.verify("orthograd", &groups)?;
        ensure_grad_shapes(&groups)?;

        for param in groups.iter().flat_map(|g| g.iter()) {
            if !param.requires_grad {
                continue;
            }
            let mut slot = param.grad_mut();
            if let Some(grad) = slot.as_mut() {
                // non-finite gradients are reported and skipped by the inner rule
                if !ops::all_finite(grad) {
                    continue;
                }
                *grad = orthogonalize(&param.data(), grad, self.config.eps);
            }
        }
        Ok(())
    }
}

impl<O: Optimizer> Optimizer for OrthoGrad<O> {
    fn name(&self) -> &'static str {
        "orthograd"
    }

    fn step(&mut self) -> Result<()> {
        self.transform_gradients()?;
        self.inner.step()
    }

    fn param_groups(&self) -> Vec<&[Tensor]> {
        self.inner.param_groups()
    }

    fn learning_rate(&self) -> f32 {
        self.inner.learning_rate()
    }

    fn state_dict(&self) -> StateDict {
        let mut dict = StateDict::new(self.name(), &self.param_groups());
        dict.inner = Some(Box::new(self.inner.state_dict()));
        dict
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<()> {
        state.check_header(self.name(), &self.param_groups())?;
        self.inner.load_state_dict(state.inner()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::{SGDConfig, SGD};
    use ndarray::arr1;

    #[test]
    fn projection_is_orthogonal_and_norm_preserving() {
        let p = arr1(&[1.0f32, 2.0, -1.0]).into_dyn();
        let g = arr1(&[0.5f32, 1.0, 3.0]).into_dyn();
        let ortho = orthogonalize(&p, &g, 1e-30);
        assert!(ops::dot(&ortho, &p).abs() < 1e-5);
        assert!((ops::norm(&ortho) - ops::norm(&g)).abs() < 1e-5);
    }

    #[test]
    fn zero_parameter_leaves_gradient_alone() {
        let p = ArrayD::zeros(ndarray::IxDyn(&[2]));
        let g = arr1(&[3.0f32, -4.0]).into_dyn();
        let ortho = orthogonalize(&p, &g, 1e-30);
        assert!((ortho[[0]] - 3.0).abs() < 1e-6 && (ortho[[1]] + 4.0).abs() < 1e-6);
    }

    #[test]
    fn step_rewrites_gradients_before_delegating() {
        let p = Tensor::from_vec(&[2], vec![1.0, 0.0]).unwrap();
        let sgd = SGD::new(vec![p.clone()], SGDConfig { lr: 0.1, ..Default::default() }).unwrap();
        let mut opt = OrthoGrad::new(sgd, OrthoGradConfig::default()).unwrap();

        // the gradient is parallel to p except for its second component
        p.set_grad(arr1(&[2.0, 1.0]).into_dyn());
        opt.step().unwrap();

        let grad = p.grad().unwrap();
        assert!(grad[[0]].abs() < 1e-6);
        assert!((grad[[1]] - 5f32.sqrt()).abs() < 1e-5);
        let data = p.data_clone();
        assert!((data[[0]] - 1.0).abs() < 1e-6);
        assert!((data[[1]] + 0.1 * 5f32.sqrt()).abs() < 1e-5);
    }
}
