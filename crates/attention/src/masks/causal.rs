//! Builders for causal attention masks.
//!
//! The resulting tensors have dtype [`MASK_DTYPE`](super::MASK_DTYPE) and shape
//! `[q_len, start_pos + q_len]`. The first `start_pos` columns belong to cached
//! keys and are always visible; the remaining block is upper-triangular.

use candle_core::{Device, Result, Tensor};

/// Construct a causal mask for `q_len` new queries following `start_pos` cached keys.
///
/// Query `q` (absolute position `start_pos + q`) may attend key `k` iff
/// `k <= start_pos + q`.
pub fn build_causal_mask(device: &Device, q_len: usize, start_pos: usize) -> Result<Tensor> {
    let k_len = start_pos + q_len;
    let data: Vec<f32> = (0..q_len)
        .flat_map(|q| {
            (0..k_len).map(move |k| {
                if k > start_pos + q {
                    f32::NEG_INFINITY
                } else {
                    0.0
                }
            })
        })
        .collect();
    Tensor::from_vec(data, (q_len, k_len), device)
}

/// Mask for one forward call; a single new token needs none.
pub fn causal_mask_for_step(
    device: &Device,
    q_len: usize,
    start_pos: usize,
) -> Result<Option<Tensor>> {
    if q_len <= 1 {
        return Ok(None);
    }
    build_causal_mask(device, q_len, start_pos).map(Some)
}
