//! Mask utilities shared by attention implementations.
//!
//! All masks produced here are additive tensors with dtype `f32`, shaped
//! `[q_len, k_len]` and broadcast over batch and heads by the kernels. Values
//! are either `0.0` (keep) or `f32::NEG_INFINITY` (discard).

pub mod causal;

use candle_core::DType;

/// Dtype shared by all additive masks.
pub const MASK_DTYPE: DType = DType::F32;

pub use causal::{build_causal_mask, causal_mask_for_step};
