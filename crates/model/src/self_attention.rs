use attention::{Attention, Config as AttentionConfig, ExactAttention, LayerCache};
use candle_core::{Tensor, Var};
use embedding::RotaryEmbedder;
use layers::{
    checks,
    linear::{Linear, LinearConfig, LinearInit},
    PrecisionPolicy,
};

use crate::{
    context::DeviceContext,
    error::{precondition, Result},
};

/// Grouped-query self-attention with rotary positions and a key/value cache.
///
/// Hidden states are `[batch, seq, d_model]`. Queries use `n_heads` heads,
/// keys and values `n_kv_heads`; cached history is stored
/// `[batch, seq, n_kv_heads, head_dim]`.
#[derive(Debug)]
pub struct AttentionBlock {
    config: AttentionConfig,
    d_model: usize,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    rotary: RotaryEmbedder,
    kernel: ExactAttention,
    policy: PrecisionPolicy,
}

impl AttentionBlock {
    pub fn new(
        d_model: usize,
        config: AttentionConfig,
        rotary: RotaryEmbedder,
        context: &DeviceContext,
    ) -> Result<Self> {
        let init = LinearInit::fan_in_uniform();
        let q_width = config.n_heads * config.head_dim;
        let kv_width = config.n_kv_heads * config.head_dim;
        let build = |out_dim| {
            Linear::with_init(
                LinearConfig::new(d_model, out_dim),
                &init,
                &context.device,
                context.dtype,
            )
        };
        let q_proj = build(q_width)?;
        let k_proj = build(kv_width)?;
        let v_proj = build(kv_width)?;
        let o_proj = Linear::with_init(
            LinearConfig::new(q_width, d_model),
            &init,
            &context.device,
            context.dtype,
        )?;

        Ok(Self {
            config,
            d_model,
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            rotary,
            kernel: ExactAttention::new(config),
            policy: context.policy(),
        })
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    /// Lists `{scope}.q_proj.weight` through `{scope}.o_proj.weight`.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        let mut params = self.q_proj.named_parameters(&format!("{scope}.q_proj"));
        params.extend(self.k_proj.named_parameters(&format!("{scope}.k_proj")));
        params.extend(self.v_proj.named_parameters(&format!("{scope}.v_proj")));
        params.extend(self.o_proj.named_parameters(&format!("{scope}.o_proj")));
        params
    }

    /// Attends `hidden` over `past` history plus itself.
    ///
    /// Returns the projected output and, when `use_cache` is set, the
    /// concatenated history including this call's keys and values.
    pub fn forward(
        &self,
        hidden: &Tensor,
        mask: Option<&Tensor>,
        past: Option<&LayerCache>,
        use_cache: bool,
    ) -> Result<(Tensor, Option<LayerCache>)> {
        checks::expect_batch_seq_hidden("attention.input", hidden, self.d_model)?;
        let (batch, seq_len, _) = hidden.dims3()?;
        let AttentionConfig {
            n_heads,
            n_kv_heads,
            head_dim,
        } = self.config;

        let queries = self
            .q_proj
            .forward(hidden, &self.policy)?
            .reshape((batch, seq_len, n_heads, head_dim))?;
        let keys = self
            .k_proj
            .forward(hidden, &self.policy)?
            .reshape((batch, seq_len, n_kv_heads, head_dim))?;
        let values = self
            .v_proj
            .forward(hidden, &self.policy)?
            .reshape((batch, seq_len, n_kv_heads, head_dim))?;

        if let Some(past) = past {
            let cached = (past.batch(), past.kv_heads(), past.head_dim());
            if cached != (batch, n_kv_heads, head_dim) {
                return Err(precondition(format!(
                    "past cache (batch, kv_heads, head_dim) {cached:?} does not match projections {:?}",
                    (batch, n_kv_heads, head_dim)
                )));
            }
        }
        let start_pos = past.map_or(0, LayerCache::seq_len);

        let (queries, keys) = self.rotary.apply(&queries, &keys, start_pos)?;
        let history = match past {
            Some(past) => past.append(&keys, &values)?,
            None => LayerCache::new(keys, values)?,
        };

        let q = queries.transpose(1, 2)?.contiguous()?;
        let k = history.keys().transpose(1, 2)?.contiguous()?;
        let v = history.values().transpose(1, 2)?.contiguous()?;
        let attended = self.kernel.attend(&q, &k, &v, mask)?;

        let merged = attended
            .transpose(1, 2)?
            .reshape((batch, seq_len, n_heads * head_dim))?;
        let output = self.o_proj.forward(&merged, &self.policy)?;

        Ok((output, use_cache.then_some(history)))
    }
}
