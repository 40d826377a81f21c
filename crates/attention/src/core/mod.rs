//! Core traits and types shared across attention implementations.
//!
//! Implementations operate on tensors with layout
//! `[batch, heads, seq_len, head_dim]`. Queries carry `n_heads` heads while keys
//! and values carry `n_kv_heads`; the output mirrors the query layout and dtype.
//! Reductions accumulate in `f32` regardless of the incoming dtype.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::Config;
pub use errors::AttentionError;

/// Unified interface for attention kernels.
///
/// * `q` is `[batch, n_heads, q_len, head_dim]`.
/// * `k` and `v` are `[batch, n_kv_heads, k_len, head_dim]`.
/// * `mask`, when present, is an additive f32 bias shaped `[q_len, k_len]`.
/// * The returned tensor mirrors the layout and dtype of `q`.
pub trait Attention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor, AttentionError>;
}
