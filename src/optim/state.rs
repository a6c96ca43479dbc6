//! # Optimizer State
//!
//! Per-parameter state lives in typed structs owned by each optimizer. For
//! checkpointing, those structs are converted to and from a [`StateDict`], a
//! serde-serializable mapping that mirrors PyTorch's `state_dict()` layout:
//! optimizer-level values, per-group values, per-parameter entries, and, for
//! wrappers, the nested state of the wrapped optimizer.

use super::ParamKey;
use crate::error::{OptimError, Result};
use crate::tensor::{Tensor, TensorData};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single stored value.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum StateValue {
    Count(u64),
    Scalar(f64),
    Buffer(ArrayD<TensorData>),
    Vector(Vec<f64>),
    Indices(Vec<usize>),
}

impl From<u64> for StateValue {
    fn from(v: u64) -> Self {
        StateValue::Count(v)
    }
}

impl From<f64> for StateValue {
    fn from(v: f64) -> Self {
        StateValue::Scalar(v)
    }
}

impl From<f32> for StateValue {
    fn from(v: f32) -> Self {
        StateValue::Scalar(v as f64)
    }
}

impl From<ArrayD<TensorData>> for StateValue {
    fn from(v: ArrayD<TensorData>) -> Self {
        StateValue::Buffer(v)
    }
}

impl From<Vec<f64>> for StateValue {
    fn from(v: Vec<f64>) -> Self {
        StateValue::Vector(v)
    }
}

impl From<Vec<usize>> for StateValue {
    fn from(v: Vec<usize>) -> Self {
        StateValue::Indices(v)
    }
}

/// Named values belonging to one parameter, one group, or the optimizer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateEntry(BTreeMap<String, StateValue>);

impl StateEntry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn with(mut self, key: &str, value: impl Into<StateValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: &str, value: impl Into<StateValue>) {
        self.0.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&StateValue> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn require(&self, key: &str) -> Result<&StateValue> {
        self.0
            .get(key)
            .ok_or_else(|| OptimError::InvalidState(format!("missing key '{key}'")))
    }

    fn wrong_kind(key: &str, kind: &str) -> OptimError {
        OptimError::InvalidState(format!("key '{key}' is not a {kind}"))
    }

    pub fn count(&self, key: &str) -> Result<u64> {
        match self.require(key)? {
            StateValue::Count(v) => Ok(*v),
            _ => Err(Self::wrong_kind(key, "count")),
        }
    }

    pub fn scalar(&self, key: &str) -> Result<f64> {
        match self.require(key)? {
            StateValue::Scalar(v) => Ok(*v),
            _ => Err(Self::wrong_kind(key, "scalar")),
        }
    }

    /// Reads a buffer and checks its shape.
    pub fn buffer(&self, key: &str, shape: &[usize]) -> Result<ArrayD<TensorData>> {
        match self.require(key)? {
            StateValue::Buffer(b) if b.shape() == shape => Ok(b.clone()),
            StateValue::Buffer(b) => Err(OptimError::InvalidState(format!(
                "buffer '{key}' has shape {:?}, expected {shape:?}",
                b.shape()
            ))),
            _ => Err(Self::wrong_kind(key, "buffer")),
        }
    }

    pub fn optional_buffer(&self, key: &str, shape: &[usize]) -> Result<Option<ArrayD<TensorData>>> {
        if self.contains(key) {
            self.buffer(key, shape).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Reads a vector and checks its length.
    pub fn vector(&self, key: &str, len: usize) -> Result<Vec<f64>> {
        match self.require(key)? {
            StateValue::Vector(v) if v.len() == len => Ok(v.clone()),
            StateValue::Vector(v) => Err(OptimError::InvalidState(format!(
                "vector '{key}' has length {}, expected {len}",
                v.len()
            ))),
            _ => Err(Self::wrong_kind(key, "vector")),
        }
    }

    pub fn indices(&self, key: &str) -> Result<Vec<usize>> {
        match self.require(key)? {
            StateValue::Indices(v) => Ok(v.clone()),
            _ => Err(Self::wrong_kind(key, "index list")),
        }
    }
}

/// Serializable snapshot of an optimizer's persistent state.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    /// Registry name of the optimizer that produced the snapshot.
    pub optimizer: String,
    /// Number of parameters in each group, used to validate on load.
    pub group_sizes: Vec<usize>,
    /// Optimizer-level values (global step counters and the like).
    pub globals: StateEntry,
    /// One entry per parameter group.
    pub groups: Vec<StateEntry>,
    /// Per-parameter entries; parameters never stepped have none.
    pub params: BTreeMap<ParamKey, StateEntry>,
    /// State of the wrapped optimizer, for wrappers.
    pub inner: Option<Box<StateDict>>,
}

impl StateDict {
    pub fn new(optimizer: &str, groups: &[&[Tensor]]) -> Self {
        StateDict {
            optimizer: optimizer.to_string(),
            group_sizes: groups.iter().map(|g| g.len()).collect(),
            groups: vec![StateEntry::new(); groups.len()],
            ..Default::default()
        }
    }

    /// Checks that the snapshot was produced by `optimizer` over the same
    /// group structure.
    pub fn check_header(&self, optimizer: &str, groups: &[&[Tensor]]) -> Result<()> {
        if self.optimizer != optimizer {
            return Err(OptimError::InvalidState(format!(
                "state dict belongs to '{}', not '{optimizer}'",
                self.optimizer
            )));
        }
        let sizes: Vec<usize> = groups.iter().map(|g| g.len()).collect();
        if self.group_sizes != sizes || self.groups.len() != sizes.len() {
            return Err(OptimError::InvalidState(format!(
                "group sizes {:?} do not match optimizer groups {sizes:?}",
                self.group_sizes
            )));
        }
        if let Some(key) = self
            .params
            .keys()
            .find(|k| k.group >= sizes.len() || k.index >= sizes[k.group])
        {
            return Err(OptimError::InvalidState(format!("parameter {key} does not exist")));
        }
        Ok(())
    }

    /// Nested dict of the wrapped optimizer.
    pub fn inner(&self) -> Result<&StateDict> {
        self.inner
            .as_deref()
            .ok_or_else(|| OptimError::InvalidState(format!("'{}' state dict has no inner state", self.optimizer)))
    }
}

/// Conversion between a typed per-parameter state and a [`StateEntry`].
pub trait ParamState: Sized {
    fn to_entry(&self) -> StateEntry;

    /// `shape` is the shape of the parameter the state belongs to.
    fn from_entry(entry: &StateEntry, shape: &[usize]) -> Result<Self>;
}

pub(crate) fn export_params<S: ParamState>(dict: &mut StateDict, state: &BTreeMap<ParamKey, S>) {
    dict.params = state.iter().map(|(k, s)| (*k, s.to_entry())).collect();
}

/// Decodes every parameter entry of `dict`; nothing is committed by the
/// caller unless all entries decode.
pub(crate) fn import_params<S: ParamState>(
    dict: &StateDict,
    groups: &[&[Tensor]],
) -> Result<BTreeMap<ParamKey, S>> {
    dict.params
        .iter()
        .map(|(key, entry)| {
            let shape = groups[key.group][key.index].shape();
            S::from_entry(entry, shape)
                .map(|s| (*key, s))
                .map_err(|e| OptimError::InvalidState(format!("parameter {key}: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::zeros;
    use ndarray::IxDyn;

    #[test]
    fn typed_reads_check_kind_and_shape() {
        let entry = StateEntry::new()
            .with("step", 3u64)
            .with("lr_scale", 0.5f32)
            .with("exp_avg", ArrayD::<f32>::zeros(IxDyn(&[2, 2])));

        assert_eq!(entry.count("step").unwrap(), 3);
        assert_eq!(entry.scalar("lr_scale").unwrap(), 0.5);
        assert!(entry.buffer("exp_avg", &[2, 2]).is_ok());
        assert!(entry.buffer("exp_avg", &[4]).is_err());
        assert!(entry.count("exp_avg").is_err());
        assert!(entry.count("missing").is_err());
        assert!(entry.optional_buffer("missing", &[1]).unwrap().is_none());
    }

    #[test]
    fn header_rejects_foreign_dicts() {
        let params = vec![zeros(&[1], true), zeros(&[2], true)];
        let groups = [params.as_slice()];
        let mut dict = StateDict::new("sgd", &groups);
        assert!(dict.check_header("sgd", &groups).is_ok());
        assert!(dict.check_header("adam", &groups).is_err());

        dict.params.insert(ParamKey::new(0, 5), StateEntry::new());
        assert!(dict.check_header("sgd", &groups).is_err());

        let fewer = [&params[..1]];
        assert!(StateDict::new("sgd", &groups).check_header("sgd", &fewer).is_err());
    }
}
