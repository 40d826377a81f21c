//! Grouped-query helpers.

use candle_core::{Result, Tensor};

/// Expands `[batch, n_kv_heads, seq, head_dim]` to `[batch, n_kv_heads * repeat, seq, head_dim]`.
///
/// Heads are repeated in place so query head `h` reads kv head `h / repeat`.
pub fn repeat_kv(x: &Tensor, repeat: usize) -> Result<Tensor> {
    if repeat == 1 {
        return Ok(x.clone());
    }
    let (batch, n_kv_heads, seq_len, head_dim) = x.dims4()?;
    x.unsqueeze(2)?
        .broadcast_as((batch, n_kv_heads, repeat, seq_len, head_dim))?
        .reshape((batch, n_kv_heads * repeat, seq_len, head_dim))
}
