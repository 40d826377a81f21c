use anyhow::Result;
use attention::masks::{build_causal_mask, causal_mask_for_step};
use attention::{Attention, Config, ExactAttention, LayerCache, ModelCache};
use candle_core::{DType, Device, IndexOp, Tensor};

/// `[batch, seq, heads, dim]` cache layout to the kernel's `[batch, heads, seq, dim]`.
fn heads_first(t: &Tensor) -> Result<Tensor> {
    Ok(t.transpose(1, 2)?.contiguous()?)
}

#[test]
fn incremental_decoding_matches_full_sequence() -> Result<()> {
    let device = Device::Cpu;
    let (batch, seq, n_heads, n_kv_heads, head_dim) = (2, 6, 4, 2, 8);
    let attention = ExactAttention::new(Config::new(n_heads, n_kv_heads, head_dim)?);

    let q = Tensor::randn(0f32, 1.0, (batch, seq, n_heads, head_dim), &device)?;
    let k = Tensor::randn(0f32, 1.0, (batch, seq, n_kv_heads, head_dim), &device)?;
    let v = Tensor::randn(0f32, 1.0, (batch, seq, n_kv_heads, head_dim), &device)?;

    let mask = build_causal_mask(&device, seq, 0)?;
    let full = attention.attend(&heads_first(&q)?, &heads_first(&k)?, &heads_first(&v)?, Some(&mask))?;

    let prefill = 4;
    let mut cache = LayerCache::new(k.i((.., ..prefill))?, v.i((.., ..prefill))?)?;
    let prefix_mask = causal_mask_for_step(&device, prefill, 0)?;
    let prefix = attention.attend(
        &heads_first(&q.i((.., ..prefill))?)?,
        &heads_first(cache.keys())?,
        &heads_first(cache.values())?,
        prefix_mask.as_ref(),
    )?;
    let diff = prefix
        .sub(&full.i((.., .., ..prefill))?)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()?;
    assert!(diff < 1e-5, "prefill diff {diff}");

    for pos in prefill..seq {
        cache = cache.append(&k.i((.., pos..pos + 1))?, &v.i((.., pos..pos + 1))?)?;
        assert!(causal_mask_for_step(&device, 1, pos)?.is_none());
        let step = attention.attend(
            &heads_first(&q.i((.., pos..pos + 1))?)?,
            &heads_first(cache.keys())?,
            &heads_first(cache.values())?,
            None,
        )?;
        let diff = step
            .sub(&full.i((.., .., pos..pos + 1))?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()?;
        assert!(diff < 1e-5, "step {pos} diff {diff}");
    }
    assert_eq!(cache.seq_len(), seq);
    Ok(())
}

#[test]
fn model_cache_collects_layers_in_order() -> Result<()> {
    let device = Device::Cpu;
    let layers = (0..3)
        .map(|layer| {
            let keys = Tensor::full(layer as f32, (1, 2, 1, 4), &device)?;
            let values = Tensor::zeros((1, 2, 1, 4), DType::F32, &device)?;
            Ok(LayerCache::new(keys, values)?)
        })
        .collect::<Result<Vec<_>>>()?;
    let cache = ModelCache::new(layers)?;

    for (idx, layer) in cache.iter().enumerate() {
        let first = layer.keys().flatten_all()?.to_vec1::<f32>()?[0];
        assert_eq!(first, idx as f32);
    }
    assert!(cache.layer(3).is_none());
    Ok(())
}
