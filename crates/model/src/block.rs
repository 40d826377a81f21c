use attention::{Config as AttentionConfig, LayerCache};
use candle_core::{Tensor, Var};
use embedding::RotaryEmbedder;
use layers::{
    linear::LinearInit,
    mlp::{FeedForwardConfig, SwiGlu},
    norm::{NormConfig, RmsNorm},
    PrecisionPolicy,
};

use crate::{context::DeviceContext, error::Result, self_attention::AttentionBlock};

/// Pre-norm decoder layer: `h = x + attn(norm(x))`, `out = h + swiglu(norm(h))`.
#[derive(Debug)]
pub struct DecoderBlock {
    attention: AttentionBlock,
    swiglu: SwiGlu,
    attention_norm: RmsNorm,
    swiglu_norm: RmsNorm,
    policy: PrecisionPolicy,
}

impl DecoderBlock {
    pub fn new(
        d_model: usize,
        activation_hidden_dim: usize,
        norm_eps: f64,
        attention_config: AttentionConfig,
        rotary: RotaryEmbedder,
        context: &DeviceContext,
    ) -> Result<Self> {
        let norm = NormConfig::new(d_model, norm_eps);
        Ok(Self {
            attention: AttentionBlock::new(d_model, attention_config, rotary, context)?,
            swiglu: SwiGlu::with_init(
                FeedForwardConfig::new(d_model, activation_hidden_dim),
                &LinearInit::fan_in_uniform(),
                &context.device,
                context.dtype,
            )?,
            attention_norm: RmsNorm::ones(norm.clone(), &context.device, context.dtype)?,
            swiglu_norm: RmsNorm::ones(norm, &context.device, context.dtype)?,
            policy: context.policy(),
        })
    }

    /// Parameters in module order under `scope` (e.g. `layers.3`).
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.attention.named_parameters(&format!("{scope}.attention"));
        params.extend(self.swiglu.named_parameters(&format!("{scope}.swiglu")));
        params.extend(
            self.attention_norm
                .named_parameters(&format!("{scope}.attention_norm")),
        );
        params.extend(self.swiglu_norm.named_parameters(&format!("{scope}.swiglu_norm")));
        params
    }

    pub fn forward(
        &self,
        hidden: &Tensor,
        mask: Option<&Tensor>,
        past: Option<&LayerCache>,
        use_cache: bool,
    ) -> Result<(Tensor, Option<LayerCache>)> {
        let normed = self.attention_norm.forward(hidden, &self.policy)?;
        let (attended, cache) = self.attention.forward(&normed, mask, past, use_cache)?;
        let h = (hidden + attended)?;

        let normed = self.swiglu_norm.forward(&h, &self.policy)?;
        let out = (&h + self.swiglu.forward(&normed, &self.policy)?)?;
        Ok((out, cache))
    }
}
