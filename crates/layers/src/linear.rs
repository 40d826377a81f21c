//! Bias-free linear projections.
//!
//! Linear layers expect inputs shaped `(batch, seq, in_dim)` (or `(rows,
//! in_dim)`) and return `(batch, seq, out_dim)`. The weight is stored as a
//! candle [`Var`] shaped `(out_dim, in_dim)` so an external optimiser or a
//! parameter copy can update it in place. Activations and weights are cast to
//! [`PrecisionPolicy::compute`] for the matmul and the result is returned in
//! the storage dtype.

use candle_core::{bail, DType, Device, Result, Tensor, Var};

use crate::{checks, dtypes::PrecisionPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearConfig {
    pub input_dim: usize,
    pub output_dim: usize,
}

impl LinearConfig {
    pub fn new(input_dim: usize, output_dim: usize) -> Self {
        Self {
            input_dim,
            output_dim,
        }
    }
}

/// Kaiming-uniform weight initialisation for a leaky-relu slope `a`.
///
/// Samples `U(-b, b)` with `b = sqrt(3) * gain / sqrt(fan_in)` and
/// `gain = sqrt(2 / (1 + a^2))`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearInit {
    pub negative_slope: f64,
}

impl LinearInit {
    /// `a = sqrt(5)`, which reduces to `U(-1/sqrt(fan_in), 1/sqrt(fan_in))`.
    pub fn fan_in_uniform() -> Self {
        Self {
            negative_slope: 5f64.sqrt(),
        }
    }

    fn sample(&self, shape: (usize, usize), device: &Device, dtype: DType) -> Result<Tensor> {
        let fan_in = shape.1 as f64;
        let gain = (2.0f64 / (1.0 + self.negative_slope.powi(2))).sqrt();
        let bound = (3f64.sqrt() * gain / fan_in.sqrt()) as f32;
        Tensor::rand(-bound, bound, shape, device)?.to_dtype(dtype)
    }
}

/// Dense projection without bias and with a mixed-precision aware forward pass.
#[derive(Debug, Clone)]
pub struct Linear {
    config: LinearConfig,
    weight: Var,
}

impl Linear {
    /// Constructs a linear layer from an existing `(output_dim, input_dim)` weight.
    pub fn new(config: LinearConfig, weight: Tensor) -> Result<Self> {
        Self::validate_weight(&config, &weight)?;
        Ok(Self {
            config,
            weight: Var::from_tensor(&weight)?,
        })
    }

    /// Samples a fresh `(output_dim, input_dim)` weight from `init`.
    pub fn with_init(
        config: LinearConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if config.input_dim == 0 || config.output_dim == 0 {
            bail!(
                "linear dimensions must be non-zero, got {}x{}",
                config.output_dim,
                config.input_dim
            );
        }
        let weight = init.sample((config.output_dim, config.input_dim), device, dtype)?;
        Self::new(config, weight)
    }

    pub fn config(&self) -> &LinearConfig {
        &self.config
    }

    /// Returns the weight variable; clones share storage with this layer.
    pub fn weight(&self) -> &Var {
        &self.weight
    }

    /// Lists the trainable parameters under `scope` (e.g. `attention.q_proj`).
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![(format!("{scope}.weight"), self.weight.clone())]
    }

    /// Applies the projection, promoting to the compute dtype for the matmul.
    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("linear.input", hidden, self.config.input_dim)?;

        let input = policy.cast_for_matmul(hidden)?;
        let weight_t = policy.cast_for_matmul(self.weight.as_tensor())?.t()?;

        let output = match input.dims() {
            [batch, seq, _] => {
                let (batch, seq) = (*batch, *seq);
                input
                    .reshape((batch * seq, self.config.input_dim))?
                    .matmul(&weight_t)?
                    .reshape((batch, seq, self.config.output_dim))?
            }
            [_, _] => input.matmul(&weight_t)?,
            dims => bail!(
                "linear expects input shaped [B, T, H_in] or [T, H_in], got {:?}",
                dims
            ),
        };

        policy.cast_to_storage(&output)
    }

    fn validate_weight(config: &LinearConfig, weight: &Tensor) -> Result<()> {
        checks::expect_rank("linear.weight", weight, 2)?;
        checks::expect_shape(
            "linear.weight",
            weight,
            &[config.output_dim, config.input_dim],
        )?;
        checks::expect_dtype_in("linear.weight", weight, checks::FLOAT_DTYPES)
    }
}
