//! # Utility Functions (`utils`)
//!
//! Provides helpers for persisting optimizer state.

pub mod serialization;

pub use serialization::{decode, encode, load_state_dict, save_state_dict};
