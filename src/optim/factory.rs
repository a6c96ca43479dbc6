//! # Optimizer Factory
//!
//! Builds optimizers by registry name from a loosely typed option map, and
//! optionally layers wrappers around the result. Every option must be
//! consumed by the selected rule or one of the requested wrappers; anything
//! left over is rejected so that typos do not silently fall back to
//! defaults.

use super::{
    AdaBound, AdaBoundConfig, AdaTAM, AdaTAMConfig, Adam, AdamConfig, Lookahead, LookaheadConfig, OrthoGrad,
    OrthoGradConfig, Optimizer, SGDConfig, SGDSaI, SGDSaIConfig, SPAMConfig, TAMConfig, TRACConfig, Yogi,
    YogiConfig, SGD, SPAM, TAM, TRAC,
};
use crate::error::{OptimError, Result};
use crate::tensor::{Tensor, TensorData};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// A single factory option.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    List(Vec<f64>),
}

impl From<bool> for OptionValue {
    fn from(v: bool) -> Self {
        OptionValue::Bool(v)
    }
}

impl From<i64> for OptionValue {
    fn from(v: i64) -> Self {
        OptionValue::Int(v)
    }
}

impl From<i32> for OptionValue {
    fn from(v: i32) -> Self {
        OptionValue::Int(v as i64)
    }
}

impl From<f64> for OptionValue {
    fn from(v: f64) -> Self {
        OptionValue::Float(v)
    }
}

impl From<f32> for OptionValue {
    fn from(v: f32) -> Self {
        OptionValue::Float(v as f64)
    }
}

impl From<Vec<f64>> for OptionValue {
    fn from(v: Vec<f64>) -> Self {
        OptionValue::List(v)
    }
}

/// Named options passed to [`create_optimizer`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerOptions(BTreeMap<String, OptionValue>);

impl OptimizerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<OptionValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<OptionValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&OptionValue> {
        self.0.get(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Typed, usage-tracking access to an [`OptimizerOptions`] map.
struct OptionReader<'a> {
    optimizer: &'a str,
    options: &'a OptimizerOptions,
    used: HashSet<&'a str>,
}

impl<'a> OptionReader<'a> {
    fn new(optimizer: &'a str, options: &'a OptimizerOptions) -> Self {
        OptionReader {
            optimizer,
            options,
            used: HashSet::new(),
        }
    }

    fn take(&mut self, key: &'static str) -> Option<&'a OptionValue> {
        let value = self.options.get(key)?;
        self.used.insert(key);
        Some(value)
    }

    fn wrong_type(key: &str, expected: &'static str) -> OptimError {
        OptimError::OptionType {
            option: key.to_string(),
            expected,
        }
    }

    fn f64(&mut self, key: &'static str, default: f64) -> Result<f64> {
        match self.take(key) {
            None => Ok(default),
            Some(OptionValue::Float(v)) => Ok(*v),
            Some(OptionValue::Int(v)) => Ok(*v as f64),
            Some(_) => Err(Self::wrong_type(key, "a number")),
        }
    }

    fn float(&mut self, key: &'static str, default: TensorData) -> Result<TensorData> {
        self.f64(key, default as f64).map(|v| v as TensorData)
    }

    fn required_float(&mut self, key: &'static str) -> Result<TensorData> {
        if self.options.get(key).is_none() {
            return Err(OptimError::MissingOption {
                optimizer: self.optimizer.to_string(),
                option: key.to_string(),
            });
        }
        self.float(key, 0.0)
    }

    fn count(&mut self, key: &'static str, default: u64) -> Result<u64> {
        match self.take(key) {
            None => Ok(default),
            Some(OptionValue::Int(v)) if *v >= 0 => Ok(*v as u64),
            Some(OptionValue::Float(v)) if *v >= 0.0 && v.fract() == 0.0 => Ok(*v as u64),
            Some(_) => Err(Self::wrong_type(key, "a non-negative integer")),
        }
    }

    fn bool(&mut self, key: &'static str, default: bool) -> Result<bool> {
        match self.take(key) {
            None => Ok(default),
            Some(OptionValue::Bool(v)) => Ok(*v),
            Some(_) => Err(Self::wrong_type(key, "a boolean")),
        }
    }

    fn list(&mut self, key: &'static str, default: &[f64]) -> Result<Vec<f64>> {
        match self.take(key) {
            None => Ok(default.to_vec()),
            Some(OptionValue::List(v)) => Ok(v.clone()),
            Some(_) => Err(Self::wrong_type(key, "a list of numbers")),
        }
    }

    fn betas(&mut self, default: (TensorData, TensorData)) -> Result<(TensorData, TensorData)> {
        match self.list("betas", &[default.0 as f64, default.1 as f64])?.as_slice() {
            &[b1, b2] => Ok((b1 as TensorData, b2 as TensorData)),
            _ => Err(Self::wrong_type("betas", "a list of two numbers")),
        }
    }

    /// Rejects the first option nothing asked for.
    fn finish(self) -> Result<()> {
        match self.options.0.keys().find(|k| !self.used.contains(k.as_str())) {
            Some(key) => Err(OptimError::UnknownOption {
                optimizer: self.optimizer.to_string(),
                option: key.clone(),
            }),
            None => Ok(()),
        }
    }
}

type Builder = fn(Vec<Tensor>, &mut OptionReader<'_>) -> Result<Box<dyn Optimizer>>;

static REGISTRY: &[(&str, Builder)] = &[
    ("sgd", build_sgd),
    ("adam", build_adam),
    ("adamw", build_adamw),
    ("adabound", build_adabound),
    ("yogi", build_yogi),
    ("sgdsai", build_sgdsai),
    ("spam", build_spam),
    ("tam", build_tam),
    ("adatam", build_adatam),
];

/// Names accepted by [`create_optimizer`].
pub fn registered_optimizers() -> Vec<&'static str> {
    REGISTRY.iter().map(|(name, _)| *name).collect()
}

/// Creates the optimizer registered as `name` (case-insensitive) over
/// `params`.
///
/// `lr` is required. The flags `orthograd`, `trac` and `lookahead` wrap the
/// rule, innermost first in that order; each wrapper reads its own prefixed
/// options (`orthograd_eps`, `trac_betas`, `trac_s_prev`, `trac_eps`,
/// `lookahead_k`, `lookahead_alpha`).
pub fn create_optimizer(name: &str, params: Vec<Tensor>, options: &OptimizerOptions) -> Result<Box<dyn Optimizer>> {
    let key = name.to_ascii_lowercase();
    let (registered, build) = REGISTRY
        .iter()
        .find(|(n, _)| *n == key)
        .copied()
        .ok_or_else(|| OptimError::UnknownOptimizer(name.to_string()))?;

    let mut reader = OptionReader::new(registered, options);
    let orthograd = if reader.bool("orthograd", false)? {
        let d = OrthoGradConfig::default();
        Some(OrthoGradConfig {
            eps: reader.f64("orthograd_eps", d.eps)?,
        })
    } else {
        None
    };
    let trac = if reader.bool("trac", false)? {
        let d = TRACConfig::default();
        Some(TRACConfig {
            betas: reader.list("trac_betas", &d.betas)?,
            s_prev: reader.f64("trac_s_prev", d.s_prev)?,
            eps: reader.f64("trac_eps", d.eps)?,
        })
    } else {
        None
    };
    let lookahead = if reader.bool("lookahead", false)? {
        let d = LookaheadConfig::default();
        Some(LookaheadConfig {
            k: reader.count("lookahead_k", d.k as u64)? as usize,
            alpha: reader.float("lookahead_alpha", d.alpha)?,
        })
    } else {
        None
    };

    let mut opt = build(params, &mut reader)?;
    reader.finish()?;

    if let Some(config) = orthograd {
        opt = Box::new(OrthoGrad::new(opt, config)?);
    }
    if let Some(config) = trac {
        opt = Box::new(TRAC::new(opt, config)?);
    }
    if let Some(config) = lookahead {
        opt = Box::new(Lookahead::new(opt, config)?);
    }
    debug!(
        "created optimizer '{}' (outermost '{}') with {} option(s)",
        registered,
        opt.name(),
        options.len()
    );
    Ok(opt)
}

// --- Builders ---

fn build_sgd(params: Vec<Tensor>, r: &mut OptionReader<'_>) -> Result<Box<dyn Optimizer>> {
    let d = SGDConfig::default();
    let config = SGDConfig {
        lr: r.required_float("lr")?,
        momentum: r.float("momentum", d.momentum)?,
        dampening: r.float("dampening", d.dampening)?,
        weight_decay: r.float("weight_decay", d.weight_decay)?,
        nesterov: r.bool("nesterov", d.nesterov)?,
    };
    Ok(Box::new(SGD::new(params, config)?))
}

fn read_adam(r: &mut OptionReader<'_>, d: AdamConfig) -> Result<AdamConfig> {
    Ok(AdamConfig {
        lr: r.required_float("lr")?,
        betas: r.betas(d.betas)?,
        eps: r.float("eps", d.eps)?,
        weight_decay: r.float("weight_decay", d.weight_decay)?,
        weight_decouple: r.bool("weight_decouple", d.weight_decouple)?,
        amsgrad: r.bool("amsgrad", d.amsgrad)?,
        cautious: r.bool("cautious", d.cautious)?,
    })
}

fn build_adam(params: Vec<Tensor>, r: &mut OptionReader<'_>) -> Result<Box<dyn Optimizer>> {
    let config = read_adam(r, AdamConfig::default())?;
    Ok(Box::new(Adam::new(params, config)?))
}

fn build_adamw(params: Vec<Tensor>, r: &mut OptionReader<'_>) -> Result<Box<dyn Optimizer>> {
    let config = read_adam(r, AdamConfig::adamw())?;
    Ok(Box::new(Adam::new(params, config)?))
}

fn build_adabound(params: Vec<Tensor>, r: &mut OptionReader<'_>) -> Result<Box<dyn Optimizer>> {
    let d = AdaBoundConfig::default();
    let config = AdaBoundConfig {
        lr: r.required_float("lr")?,
        final_lr: r.float("final_lr", d.final_lr)?,
        betas: r.betas(d.betas)?,
        gamma: r.float("gamma", d.gamma)?,
        weight_decay: r.float("weight_decay", d.weight_decay)?,
        weight_decouple: r.bool("weight_decouple", d.weight_decouple)?,
        fixed_decay: r.bool("fixed_decay", d.fixed_decay)?,
        ams_bound: r.bool("ams_bound", d.ams_bound)?,
        adam_debias: r.bool("adam_debias", d.adam_debias)?,
        eps: r.float("eps", d.eps)?,
    };
    Ok(Box::new(AdaBound::new(params, config)?))
}

fn build_yogi(params: Vec<Tensor>, r: &mut OptionReader<'_>) -> Result<Box<dyn Optimizer>> {
    let d = YogiConfig::default();
    let config = YogiConfig {
        lr: r.required_float("lr")?,
        betas: r.betas(d.betas)?,
        initial_accumulator: r.float("initial_accumulator", d.initial_accumulator)?,
        weight_decay: r.float("weight_decay", d.weight_decay)?,
        weight_decouple: r.bool("weight_decouple", d.weight_decouple)?,
        fixed_decay: r.bool("fixed_decay", d.fixed_decay)?,
        adam_debias: r.bool("adam_debias", d.adam_debias)?,
        eps: r.float("eps", d.eps)?,
    };
    Ok(Box::new(Yogi::new(params, config)?))
}

fn build_sgdsai(params: Vec<Tensor>, r: &mut OptionReader<'_>) -> Result<Box<dyn Optimizer>> {
    let d = SGDSaIConfig::default();
    let config = SGDSaIConfig {
        lr: r.required_float("lr")?,
        momentum: r.float("momentum", d.momentum)?,
        weight_decay: r.float("weight_decay", d.weight_decay)?,
        weight_decouple: r.bool("weight_decouple", d.weight_decouple)?,
        eps: r.float("eps", d.eps)?,
    };
    Ok(Box::new(SGDSaI::new(params, config)?))
}

fn build_spam(params: Vec<Tensor>, r: &mut OptionReader<'_>) -> Result<Box<dyn Optimizer>> {
    let d = SPAMConfig::default();
    let config = SPAMConfig {
        lr: r.required_float("lr")?,
        betas: r.betas(d.betas)?,
        density: r.float("density", d.density)?,
        weight_decay: r.float("weight_decay", d.weight_decay)?,
        warmup_epoch: r.count("warmup_epoch", d.warmup_epoch)?,
        threshold: r.float("threshold", d.threshold)?,
        grad_accu_steps: r.count("grad_accu_steps", d.grad_accu_steps)?,
        update_proj_gap: r.count("update_proj_gap", d.update_proj_gap)?,
        eps: r.float("eps", d.eps)?,
        cautious: r.bool("cautious", d.cautious)?,
        seed: r.count("seed", d.seed)?,
    };
    Ok(Box::new(SPAM::new(params, config)?))
}

fn build_tam(params: Vec<Tensor>, r: &mut OptionReader<'_>) -> Result<Box<dyn Optimizer>> {
    let d = TAMConfig::default();
    let config = TAMConfig {
        lr: r.required_float("lr")?,
        momentum: r.float("momentum", d.momentum)?,
        decay: r.float("decay", d.decay)?,
        weight_decay: r.float("weight_decay", d.weight_decay)?,
        weight_decouple: r.bool("weight_decouple", d.weight_decouple)?,
        fixed_decay: r.bool("fixed_decay", d.fixed_decay)?,
        cautious: r.bool("cautious", d.cautious)?,
        eps: r.float("eps", d.eps)?,
    };
    Ok(Box::new(TAM::new(params, config)?))
}

fn build_adatam(params: Vec<Tensor>, r: &mut OptionReader<'_>) -> Result<Box<dyn Optimizer>> {
    let d = AdaTAMConfig::default();
    let config = AdaTAMConfig {
        lr: r.required_float("lr")?,
        betas: r.betas(d.betas)?,
        decay: r.float("decay", d.decay)?,
        weight_decay: r.float("weight_decay", d.weight_decay)?,
        weight_decouple: r.bool("weight_decouple", d.weight_decouple)?,
        fixed_decay: r.bool("fixed_decay", d.fixed_decay)?,
        cautious: r.bool("cautious", d.cautious)?,
        eps: r.float("eps", d.eps)?,
    };
    Ok(Box::new(AdaTAM::new(params, config)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::zeros;

    fn params() -> Vec<Tensor> {
        vec![zeros(&[3], true), zeros(&[2, 2], true)]
    }

    #[test]
    fn every_registered_name_builds_with_lr_only() {
        for name in registered_optimizers() {
            let opt = create_optimizer(name, params(), &OptimizerOptions::new().with("lr", 0.01)).unwrap();
            assert_eq!(opt.name(), name);
            assert!((opt.learning_rate() - 0.01).abs() < 1e-9);
        }
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let opt = create_optimizer("AdamW", params(), &OptimizerOptions::new().with("lr", 1e-3)).unwrap();
        assert_eq!(opt.name(), "adamw");
    }

    #[test]
    fn option_errors() {
        let err = create_optimizer("nope", params(), &OptimizerOptions::new()).err().unwrap();
        assert!(matches!(err, OptimError::UnknownOptimizer(ref n) if n == "nope"));

        let err = create_optimizer("sgd", params(), &OptimizerOptions::new()).err().unwrap();
        assert!(matches!(err, OptimError::MissingOption { ref option, .. } if option == "lr"));

        let opts = OptimizerOptions::new().with("lr", 0.1).with("momentun", 0.9);
        let err = create_optimizer("sgd", params(), &opts).err().unwrap();
        assert!(matches!(err, OptimError::UnknownOption { ref option, .. } if option == "momentun"));

        let opts = OptimizerOptions::new().with("lr", 0.1).with("nesterov", 1);
        let err = create_optimizer("sgd", params(), &opts).err().unwrap();
        assert!(matches!(err, OptimError::OptionType { .. }));

        let opts = OptimizerOptions::new().with("lr", 0.1).with("betas", vec![0.9]);
        assert!(create_optimizer("adam", params(), &opts).is_err());
    }

    #[test]
    fn wrapper_options_require_their_flag() {
        let opts = OptimizerOptions::new().with("lr", 0.1).with("lookahead_k", 3);
        let err = create_optimizer("sgd", params(), &opts).err().unwrap();
        assert!(matches!(err, OptimError::UnknownOption { ref option, .. } if option == "lookahead_k"));
    }

    #[test]
    fn wrappers_layer_innermost_first() {
        let opts = OptimizerOptions::new()
            .with("lr", 0.1)
            .with("orthograd", true)
            .with("trac", true)
            .with("lookahead", true)
            .with("lookahead_k", 3);
        let opt = create_optimizer("tam", params(), &opts).unwrap();

        let dict = opt.state_dict();
        let chain: Vec<&str> = std::iter::successors(Some(&dict), |d| d.inner.as_deref())
            .map(|d| d.optimizer.as_str())
            .collect();
        assert_eq!(chain, vec!["lookahead", "trac", "orthograd", "tam"]);
        assert!((opt.learning_rate() - 0.1).abs() < 1e-9);
    }
}
