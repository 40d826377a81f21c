//! Positional encodings applied inside attention.

pub mod rope;

pub use rope::{FrequencyTable, RopeConfig, RotaryEmbedder};
