//! Dense grouped-query attention.
//!
//! Scores, the additive mask and the softmax are all evaluated in `f32`; the
//! result is cast back to the query dtype.

use std::sync::OnceLock;

use candle_core::{DType, Tensor};
use candle_nn::ops::softmax_last_dim;

use crate::core::{Attention, AttentionError, Config};
use crate::grouped::repeat_kv;
use crate::masks::MASK_DTYPE;

/// Softmax attention over whole score matrices. Logs its geometry on first use.
#[derive(Debug)]
pub struct ExactAttention {
    config: Config,
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            first_call: OnceLock::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn check_inputs(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
    ) -> Result<(usize, usize, usize), AttentionError> {
        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::InvalidShape {
                context: "q, k, v must reside on the same device".to_string(),
            });
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::InvalidShape {
                context: "q, k, v must share the same dtype".to_string(),
            });
        }
        if !matches!(dtype, DType::F32 | DType::F16 | DType::BF16) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let Config {
            n_heads,
            n_kv_heads,
            head_dim,
        } = self.config;
        let (batch, qh, q_len, qd) = q.dims4().map_err(|_| AttentionError::InvalidShape {
            context: "q must have shape [batch, heads, seq_len, head_dim]".to_string(),
        })?;
        let (kb, kh, k_len, kd) = k.dims4().map_err(|_| AttentionError::InvalidShape {
            context: "k must have shape [batch, kv_heads, seq_len, head_dim]".to_string(),
        })?;
        if qh != n_heads || qd != head_dim {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "q shape mismatch: expected [{batch}, {n_heads}, ?, {head_dim}] got {:?}",
                    q.dims()
                ),
            });
        }
        if kb != batch || kh != n_kv_heads || kd != head_dim {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "k shape mismatch: expected [{batch}, {n_kv_heads}, ?, {head_dim}] got [{kb}, {kh}, {k_len}, {kd}]"
                ),
            });
        }
        if v.dims() != k.dims() {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "v shape mismatch: expected {:?} got {:?}",
                    k.dims(),
                    v.dims()
                ),
            });
        }
        Ok((batch, q_len, k_len))
    }

    fn check_mask(mask: &Tensor, q: &Tensor, q_len: usize, k_len: usize) -> Result<(), AttentionError> {
        if !q.device().same_device(mask.device()) {
            return Err(AttentionError::InvalidShape {
                context: "mask must reside on the same device as q".to_string(),
            });
        }
        if mask.dtype() != MASK_DTYPE {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("mask expects dtype {MASK_DTYPE:?}, got {:?}", mask.dtype()),
            });
        }
        match mask.dims() {
            [mq, mk] if *mq == q_len && *mk == k_len => Ok(()),
            dims => Err(AttentionError::InvalidShape {
                context: format!("mask must be [{q_len}, {k_len}], got {dims:?}"),
            }),
        }
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init n_heads={} n_kv_heads={} head_dim={} dtype={:?}",
                self.config.n_heads,
                self.config.n_kv_heads,
                self.config.head_dim,
                q.dtype()
            );
        }

        let (_, q_len, k_len) = self.check_inputs(q, k, v)?;
        if let Some(mask) = mask {
            Self::check_mask(mask, q, q_len, k_len)?;
        }

        let group = self.config.group_size();
        let q_work = q.to_dtype(DType::F32)?.contiguous()?;
        let k_work = repeat_kv(&k.to_dtype(DType::F32)?, group)?.contiguous()?;
        let v_work = repeat_kv(&v.to_dtype(DType::F32)?, group)?.contiguous()?;

        let k_t = k_work.t()?.contiguous()?;
        let mut scores = (q_work.matmul(&k_t)? * self.config.scale())?;
        if let Some(mask) = mask {
            scores = scores.broadcast_add(mask)?;
        }

        let probs = softmax_last_dim(&scores)?;
        let output = probs.matmul(&v_work)?;
        Ok(output.to_dtype(q.dtype())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::build_causal_mask;
    use candle_core::{Device, Result as CandleResult};

    fn naive_attention(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> CandleResult<Tensor> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (_, kv_heads, k_len, _) = k.dims4()?;
        let group = heads / kv_heads;
        let mut output = vec![0f32; batch * heads * q_len * head_dim];

        let q_vec = q.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let mask_vec = match mask {
            Some(m) => Some(m.flatten_all()?.to_vec1::<f32>()?),
            None => None,
        };
        let scale = 1.0 / (head_dim as f32).sqrt();

        for b in 0..batch {
            for h in 0..heads {
                let kvh = h / group;
                for q_idx in 0..q_len {
                    let mut row = vec![0f32; k_len];
                    let mut max_val = f32::NEG_INFINITY;
                    for k_idx in 0..k_len {
                        let mut dot = 0f32;
                        for d in 0..head_dim {
                            let qi = ((b * heads + h) * q_len + q_idx) * head_dim + d;
                            let ki = ((b * kv_heads + kvh) * k_len + k_idx) * head_dim + d;
                            dot += q_vec[qi] * k_vec[ki];
                        }
                        dot *= scale;
                        if let Some(mask_vec) = &mask_vec {
                            dot += mask_vec[q_idx * k_len + k_idx];
                        }
                        row[k_idx] = dot;
                        if dot > max_val {
                            max_val = dot;
                        }
                    }
                    let mut denom = 0f32;
                    for val in row.iter_mut() {
                        *val = (*val - max_val).exp();
                        denom += *val;
                    }
                    for d in 0..head_dim {
                        let mut acc = 0f32;
                        for k_idx in 0..k_len {
                            let vi = ((b * kv_heads + kvh) * k_len + k_idx) * head_dim + d;
                            acc += row[k_idx] / denom * v_vec[vi];
                        }
                        output[((b * heads + h) * q_len + q_idx) * head_dim + d] = acc;
                    }
                }
            }
        }

        Tensor::from_vec(output, (batch, heads, q_len, head_dim), q.device())
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn grouped_attention_matches_naive() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (2, 4, 3, 8), &device)?;
        let k = Tensor::randn(0f32, 1.0, (2, 2, 5, 8), &device)?;
        let v = Tensor::randn(0f32, 1.0, (2, 2, 5, 8), &device)?;
        let mask = build_causal_mask(&device, 3, 2)?;

        let attention = ExactAttention::new(Config::new(4, 2, 8).unwrap());
        let output = attention.attend(&q, &k, &v, Some(&mask)).unwrap();
        let expected = naive_attention(&q, &k, &v, Some(&mask))?;
        assert!(max_diff(&output, &expected)? < 1e-5);
        Ok(())
    }

    #[test]
    fn full_kv_heads_equal_explicit_repetition() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (1, 4, 4, 4), &device)?;
        let k = Tensor::randn(0f32, 1.0, (1, 1, 4, 4), &device)?;
        let v = Tensor::randn(0f32, 1.0, (1, 1, 4, 4), &device)?;
        let mask = build_causal_mask(&device, 4, 0)?;

        let grouped = ExactAttention::new(Config::new(4, 1, 4).unwrap())
            .attend(&q, &k, &v, Some(&mask))
            .unwrap();
        let k_full = repeat_kv(&k, 4)?;
        let v_full = repeat_kv(&v, 4)?;
        let plain = ExactAttention::new(Config::new(4, 4, 4).unwrap())
            .attend(&q, &k_full, &v_full, Some(&mask))
            .unwrap();
        assert!(max_diff(&grouped, &plain)? < 1e-6);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() {
        let device = Device::Cpu;
        let attention = ExactAttention::new(Config::new(2, 1, 8).unwrap());
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let err = attention.attend(&q, &k, &k, None).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));

        let k = Tensor::zeros((1, 1, 4, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 1, 5, 8), DType::F32, &device).unwrap();
        let err = attention.attend(&q, &k, &v, None).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn mask_shape_validation() {
        let device = Device::Cpu;
        let attention = ExactAttention::new(Config::new(2, 2, 8).unwrap());
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let mask = Tensor::zeros((4, 3), DType::F32, &device).unwrap();
        let err = attention.attend(&q, &q, &q, Some(&mask)).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn dtype_matrix() -> CandleResult<()> {
        let device = Device::Cpu;
        let data: Vec<f32> = (0..64).map(|i| (i as f32) * 0.01).collect();
        let q = Tensor::from_vec(data.clone(), (1, 2, 4, 8), &device)?;
        let k = Tensor::from_vec(data[..32].to_vec(), (1, 1, 4, 8), &device)?;
        let mask = build_causal_mask(&device, 4, 0)?;
        let attention = ExactAttention::new(Config::new(2, 1, 8).unwrap());
        let reference = attention.attend(&q, &k, &k, Some(&mask)).unwrap();

        for dtype in [DType::F32, DType::BF16, DType::F16] {
            let q_cast = q.to_dtype(dtype)?;
            let k_cast = k.to_dtype(dtype)?;
            let out = attention.attend(&q_cast, &k_cast, &k_cast, Some(&mask)).unwrap();
            assert_eq!(out.dtype(), dtype);
            let max = max_diff(&out, &reference)?;
            assert!(max < 5e-2, "dtype {:?} diverged by {max}", dtype);
        }
        Ok(())
    }

    #[test]
    fn numerical_stability() {
        let device = Device::Cpu;
        let q = Tensor::full(10_000.0f32, (1, 1, 4, 4), &device).unwrap();
        let k = Tensor::full(-10_000.0f32, (1, 1, 4, 4), &device).unwrap();
        let v = Tensor::ones((1, 1, 4, 4), DType::F32, &device).unwrap();
        let out = ExactAttention::new(Config::new(1, 1, 4).unwrap())
            .attend(&q, &k, &v, None)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(out.iter().all(|value| value.is_finite()));
    }
}
