//! Root-mean-square normalisation.
//!
//! Inputs follow the `(batch, seq, hidden)` convention and are normalised along
//! the last axis. Statistics are promoted to [`PrecisionPolicy::reduction`],
//! the normalised activations are cast back to the input dtype and only then
//! scaled by the learned weight, so half-precision models see the same rounding
//! points regardless of the compute backend.

use candle_core::{bail, DType, Device, Result, Tensor, Var, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration for an RMS normalisation layer.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the mean square.
    pub epsilon: f64,
}

impl NormConfig {
    pub fn new(hidden_size: usize, epsilon: f64) -> Self {
        Self {
            hidden_size,
            epsilon,
        }
    }
}

/// RMSNorm with a learnable per-channel scale.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    config: NormConfig,
    weight: Var,
}

impl RmsNorm {
    /// Constructs a norm from an existing `(hidden_size,)` scale.
    pub fn new(weight: Tensor, config: NormConfig) -> Result<Self> {
        if config.epsilon.is_nan() || config.epsilon <= 0.0 {
            bail!("norm epsilon must be positive, got {}", config.epsilon);
        }
        checks::expect_shape("norm.weight", &weight, &[config.hidden_size])?;
        checks::expect_dtype_in("norm.weight", &weight, checks::FLOAT_DTYPES)?;
        Ok(Self {
            config,
            weight: Var::from_tensor(&weight)?,
        })
    }

    /// Constructs a norm whose scale starts at one.
    pub fn ones(config: NormConfig, device: &Device, dtype: DType) -> Result<Self> {
        let weight = Tensor::ones(config.hidden_size, dtype, device)?;
        Self::new(weight, config)
    }

    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    pub fn weight(&self) -> &Var {
        &self.weight
    }

    /// Lists the scale parameter under `scope` (e.g. `layers.0.attention_norm`).
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![(format!("{scope}.weight"), self.weight.clone())]
    }

    /// Normalises `hidden` along its last axis. NaN and Inf propagate.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("norm.input", hidden, self.config.hidden_size)?;

        let input_dtype = hidden.dtype();
        let compute = policy.cast_for_reduction(hidden)?;
        let mean_square = (compute.sqr()?.sum_keepdim(D::Minus1)? / self.config.hidden_size as f64)?;
        let inv_rms = (mean_square + self.config.epsilon)?.sqrt()?.recip()?;
        let normalized = compute.broadcast_mul(&inv_rms)?.to_dtype(input_dtype)?;

        let weight = self.weight.as_tensor().to_dtype(input_dtype)?;
        normalized.broadcast_mul(&weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device, Tensor};
    use candle_nn::ops;

    fn build_input(
        device: &Device,
        dtype: DType,
        batch: usize,
        seq: usize,
        hidden: usize,
    ) -> Result<Tensor> {
        let total = batch * seq * hidden;
        let data = (0..total)
            .map(|i| (i as f32 * 0.25_f32) - 1.5_f32)
            .collect::<Vec<_>>();
        Tensor::from_vec(data, (batch, seq, hidden), device)?.to_dtype(dtype)
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn rms_norm_matches_reference_across_dtypes() -> Result<()> {
        let device = Device::Cpu;
        let (batch, seq, hidden) = (2, 4, 6);
        let config = NormConfig::new(hidden, 1e-6);

        let weight_f32 = Tensor::from_vec(
            (0..hidden)
                .map(|i| 1.0_f32 + (i as f32) * 0.01)
                .collect::<Vec<_>>(),
            (hidden,),
            &device,
        )?;

        for &dtype in &[DType::F32, DType::F16, DType::BF16] {
            let input = build_input(&device, dtype, batch, seq, hidden)?;
            let weight = weight_f32.to_dtype(dtype)?;
            let norm = RmsNorm::new(weight.clone(), config.clone())?;
            let policy = PrecisionPolicy::from_parameter_dtype(dtype);
            let output = norm.forward(&input, &policy)?;

            assert_eq!(output.dims(), input.dims());
            assert_eq!(output.dtype(), dtype);

            let reference = ops::rms_norm(&input, &weight, config.epsilon as f32)?;
            let tol = match dtype {
                DType::F16 => 5e-3,
                DType::BF16 => 3e-2,
                _ => 5e-4,
            };
            let diff = max_diff(&output, &reference)?;
            assert!(diff < tol, "max diff {} for dtype {:?}", diff, dtype);
        }
        Ok(())
    }

    #[test]
    fn unit_scale_yields_unit_rms() -> Result<()> {
        let device = Device::Cpu;
        let hidden = 16;
        let norm = RmsNorm::ones(NormConfig::new(hidden, 1e-6), &device, DType::F32)?;
        let input = build_input(&device, DType::F32, 2, 128, hidden)?;
        let output = norm.forward(&input, &PrecisionPolicy::default())?;

        let rms = (output.sqr()?.sum_keepdim(D::Minus1)? / hidden as f64)?
            .sqrt()?
            .flatten_all()?
            .to_vec1::<f32>()?;
        for value in rms {
            assert!((value - 1.0).abs() < 1e-3, "row rms {value}");
        }
        Ok(())
    }

    #[test]
    fn zero_rows_stay_finite() -> Result<()> {
        let device = Device::Cpu;
        let norm = RmsNorm::ones(NormConfig::new(4, 1e-6), &device, DType::F32)?;
        let input = Tensor::zeros((1, 2, 4), DType::F32, &device)?;
        let output = norm.forward(&input, &PrecisionPolicy::default())?;
        assert_eq!(output.flatten_all()?.to_vec1::<f32>()?, vec![0.0; 8]);
        Ok(())
    }

    #[test]
    fn scale_updates_through_parameter_handle() -> Result<()> {
        let device = Device::Cpu;
        let norm = RmsNorm::ones(NormConfig::new(2, 1e-6), &device, DType::F32)?;
        let (name, handle) = norm.named_parameters("output_norm").remove(0);
        assert_eq!(name, "output_norm.weight");
        handle.set(&Tensor::new(&[2.0f32, 3.0], &device)?)?;

        let input = Tensor::new(&[[[1.0f32, 1.0]]], &device)?;
        let output = norm.forward(&input, &PrecisionPolicy::default())?;
        let values = output.flatten_all()?.to_vec1::<f32>()?;
        assert!((values[0] - 2.0).abs() < 1e-4);
        assert!((values[1] - 3.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn rejects_wrong_hidden_size() -> Result<()> {
        let device = Device::Cpu;
        let norm = RmsNorm::ones(NormConfig::new(4, 1e-6), &device, DType::F32)?;
        let input = Tensor::zeros((1, 2, 3), DType::F32, &device)?;
        assert!(norm.forward(&input, &PrecisionPolicy::default()).is_err());
        assert!(RmsNorm::ones(NormConfig::new(4, 0.0), &device, DType::F32).is_err());
        Ok(())
    }
}
