//! # State Dict Serialization Utilities
//!
//! Functions for saving and loading optimizer state dicts.
//! Uses `serde` for serialization and `bincode` as the binary format.

use crate::optim::StateDict;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

// --- Error Type ---
#[derive(thiserror::Error, Debug)]
pub enum SerializationError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization Error (Bincode): {0}")]
    Bincode(#[from] bincode::Error),
}

/// Encodes a state dict into bytes.
pub fn encode(state: &StateDict) -> Result<Vec<u8>, SerializationError> {
    Ok(bincode::serialize(state)?)
}

/// Decodes bytes produced by [`encode`].
pub fn decode(bytes: &[u8]) -> Result<StateDict, SerializationError> {
    Ok(bincode::deserialize(bytes)?)
}

// --- Save Function ---

/// Saves a state dict to a file.
pub fn save_state_dict<P: AsRef<Path>>(state: &StateDict, path: P) -> Result<(), SerializationError> {
    let file = File::create(path.as_ref())?;
    let writer = BufWriter::new(file);
    bincode::serialize_into(writer, state)?;
    Ok(())
}

// --- Load Function ---

/// Loads a state dict saved by [`save_state_dict`]. The result still has to
/// be handed to `Optimizer::load_state_dict`, which validates it.
pub fn load_state_dict<P: AsRef<Path>>(path: P) -> Result<StateDict, SerializationError> {
    let file = File::open(path.as_ref())?;
    let reader = BufReader::new(file);
    Ok(bincode::deserialize_from(reader)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::{ParamKey, StateEntry};
    use crate::tensor::zeros;
    use ndarray::{ArrayD, IxDyn};

    fn sample() -> StateDict {
        let params = vec![zeros(&[2, 3], true)];
        let mut dict = StateDict::new("adam", &[params.as_slice()]);
        dict.globals.insert("total_step", 7u64);
        dict.params.insert(
            ParamKey::new(0, 0),
            StateEntry::new()
                .with("exp_avg", ArrayD::from_elem(IxDyn(&[2, 3]), 0.25f32))
                .with("mask", vec![0usize, 4])
                .with("s", vec![1e-8, f64::MIN_POSITIVE]),
        );
        dict
    }

    #[test]
    fn bytes_round_trip_exactly() {
        let dict = sample();
        let bytes = encode(&dict).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, dict);
        assert_eq!(encode(&decoded).unwrap(), bytes);
    }

    #[test]
    fn file_round_trip() {
        let path = std::env::temp_dir().join(format!("rtorch_optim_state_{}.bin", std::process::id()));
        let dict = sample();
        save_state_dict(&dict, &path).unwrap();
        let loaded = load_state_dict(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(loaded, dict);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(decode(&[1, 2, 3]), Err(SerializationError::Bincode(_))));
    }
}
