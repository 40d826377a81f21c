//! SwiGLU position-wise feed-forward block.
//!
//! Hidden states shaped `(batch, seq, hidden)` are projected twice into the
//! intermediate space, combined as `silu(w_0 x) * w_1 x`, then contracted back
//! to the model width by `w_2`. All three projections are bias-free.

use candle_core::{bail, DType, Device, Result, Tensor, Var};

use crate::{
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
};

/// Configuration for the gated feed-forward network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedForwardConfig {
    /// Model hidden size.
    pub hidden_size: usize,
    /// Width of the gated activation space.
    pub intermediate_size: usize,
}

impl FeedForwardConfig {
    pub fn new(hidden_size: usize, intermediate_size: usize) -> Self {
        Self {
            hidden_size,
            intermediate_size,
        }
    }
}

/// `w_2(silu(w_0 x) * w_1 x)`.
#[derive(Debug, Clone)]
pub struct SwiGlu {
    config: FeedForwardConfig,
    w_0: Linear,
    w_1: Linear,
    w_2: Linear,
}

impl SwiGlu {
    /// Assembles the block from existing projections, checking their widths.
    pub fn new(config: FeedForwardConfig, w_0: Linear, w_1: Linear, w_2: Linear) -> Result<Self> {
        let up = LinearConfig::new(config.hidden_size, config.intermediate_size);
        let down = LinearConfig::new(config.intermediate_size, config.hidden_size);
        for (name, layer, expected) in [("w_0", &w_0, up), ("w_1", &w_1, up), ("w_2", &w_2, down)] {
            if *layer.config() != expected {
                bail!(
                    "swiglu.{name} expected {}->{}, got {}->{}",
                    expected.input_dim,
                    expected.output_dim,
                    layer.config().input_dim,
                    layer.config().output_dim
                );
            }
        }
        Ok(Self {
            config,
            w_0,
            w_1,
            w_2,
        })
    }

    /// Builds the block with freshly initialised projections.
    pub fn with_init(
        config: FeedForwardConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        let up = LinearConfig::new(config.hidden_size, config.intermediate_size);
        let down = LinearConfig::new(config.intermediate_size, config.hidden_size);
        let w_0 = Linear::with_init(up, init, device, dtype)?;
        let w_1 = Linear::with_init(up, init, device, dtype)?;
        let w_2 = Linear::with_init(down, init, device, dtype)?;
        Self::new(config, w_0, w_1, w_2)
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    /// Lists `{scope}.w_0.weight`, `{scope}.w_1.weight` and `{scope}.w_2.weight`.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.w_0.named_parameters(&format!("{scope}.w_0"));
        params.extend(self.w_1.named_parameters(&format!("{scope}.w_1")));
        params.extend(self.w_2.named_parameters(&format!("{scope}.w_2")));
        params
    }

    pub fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_batch_seq_hidden("swiglu.input", hidden, self.config.hidden_size)?;

        let gate = policy.cast_for_matmul(&self.w_0.forward(hidden, policy)?)?;
        let up = policy.cast_for_matmul(&self.w_1.forward(hidden, policy)?)?;
        let activated = candle_nn::ops::silu(&gate)?.mul(&up)?;
        self.w_2.forward(&policy.cast_to_storage(&activated)?, policy)
    }
}
