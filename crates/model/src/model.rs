use std::collections::HashMap;
use std::sync::Arc;

use attention::{masks::causal_mask_for_step, Config as AttentionConfig, ModelCache};
use candle_core::{Tensor, Var};
use embedding::{
    positional::rope::{FrequencyTable, RopeConfig, RotaryEmbedder},
    token::{TokenEmbedding, TokenEmbeddingConfig},
};
use layers::{
    linear::{Linear, LinearConfig, LinearInit},
    norm::{NormConfig, RmsNorm},
    PrecisionPolicy,
};

use crate::{
    block::DecoderBlock,
    config::{ModelConfig, ModelHyperparameters},
    context::DeviceContext,
    error::{precondition, ModelError, Result},
    portable::{PortableConfig, PortableModel},
};

/// Decoder-only transformer: embedding, decoder layers, final norm and a
/// bias-free vocabulary projection.
#[derive(Debug)]
pub struct Model {
    config: ModelConfig,
    context: DeviceContext,
    policy: PrecisionPolicy,
    rope_table: Arc<FrequencyTable>,
    embedding_proj: TokenEmbedding,
    layers: Vec<DecoderBlock>,
    output_norm: RmsNorm,
    de_embedding_proj: Linear,
}

impl Model {
    /// Builds an f32 model on the CPU.
    pub fn new(hyperparameters: &impl ModelHyperparameters) -> Result<Self> {
        Self::with_context(hyperparameters, &DeviceContext::default())
    }

    /// Builds the model and its component blocks on `context`.
    pub fn with_context(
        hyperparameters: &impl ModelHyperparameters,
        context: &DeviceContext,
    ) -> Result<Self> {
        hyperparameters.validate()?;
        let config = ModelConfig::from_hyperparameters(hyperparameters);
        let head_dim = config.head_dim();

        let rope_table = FrequencyTable::shared(
            RopeConfig::new(head_dim, config.position_emb_theta, config.max_seq_len),
            &context.device,
        )?;
        let attention_config = AttentionConfig::new(
            config.attention_n_heads,
            config.attention_n_kv_heads,
            head_dim,
        )?;

        let embedding_proj = TokenEmbedding::new(TokenEmbeddingConfig {
            vocab_size: config.vocab_size,
            hidden_dim: config.d_model,
            dtype: context.dtype,
            device: context.device.clone(),
        })?;

        let layers = (0..config.n_layers)
            .map(|_| {
                DecoderBlock::new(
                    config.d_model,
                    config.activation_hidden_dim,
                    config.norm_eps,
                    attention_config,
                    RotaryEmbedder::new(Arc::clone(&rope_table)),
                    context,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        let output_norm = RmsNorm::ones(
            NormConfig::new(config.d_model, config.norm_eps),
            &context.device,
            context.dtype,
        )?;
        let de_embedding_proj = Linear::with_init(
            LinearConfig::new(config.d_model, config.vocab_size),
            &LinearInit::fan_in_uniform(),
            &context.device,
            context.dtype,
        )?;

        let model = Self {
            policy: context.policy(),
            context: context.clone(),
            rope_table,
            embedding_proj,
            layers,
            output_norm,
            de_embedding_proj,
            config,
        };
        log::info!(
            "pico model ready: d_model={} layers={} heads={}/{} vocab={} max_seq_len={} dtype={:?} params={}",
            model.config.d_model,
            model.config.n_layers,
            model.config.attention_n_heads,
            model.config.attention_n_kv_heads,
            model.config.vocab_size,
            model.config.max_seq_len,
            model.context.dtype,
            model.num_parameters()
        );
        Ok(model)
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn context(&self) -> &DeviceContext {
        &self.context
    }

    /// Rotary table shared by every layer of this model.
    pub fn rope_table(&self) -> &Arc<FrequencyTable> {
        &self.rope_table
    }

    /// Produces f32 logits `[batch, seq, vocab_size]` for `token_ids` `[batch, seq]`.
    ///
    /// `past` continues decoding after previously cached positions. With
    /// `use_cache`, the returned cache holds `past` plus this call's positions.
    pub fn forward(
        &self,
        token_ids: &Tensor,
        past: Option<&ModelCache>,
        use_cache: bool,
    ) -> Result<(Tensor, Option<ModelCache>)> {
        let (batch, seq_len) = match token_ids.dims() {
            [batch, seq] => (*batch, *seq),
            dims => {
                return Err(precondition(format!(
                    "token ids must be shaped [batch, seq], got {dims:?}"
                )))
            }
        };

        if let Some(past) = past {
            if past.len() != self.layers.len() {
                return Err(precondition(format!(
                    "past cache has {} layers but the model has {}",
                    past.len(),
                    self.layers.len()
                )));
            }
            if past.batch() != batch {
                return Err(precondition(format!(
                    "past cache batch {} does not match input batch {batch}",
                    past.batch()
                )));
            }
        }
        let start_pos = past.map_or(0, ModelCache::seq_len);
        if start_pos + seq_len > self.config.max_seq_len {
            return Err(precondition(format!(
                "positions {start_pos}..{} exceed max_seq_len {}",
                start_pos + seq_len,
                self.config.max_seq_len
            )));
        }
        log::trace!("pico forward batch={batch} seq={seq_len} start_pos={start_pos} use_cache={use_cache}");

        let mut hidden = self
            .embedding_proj
            .forward(token_ids)
            .map_err(|err| precondition(format!("token ids rejected: {err}")))?;
        let mask = causal_mask_for_step(&self.context.device, seq_len, start_pos)?;

        let mut caches = Vec::with_capacity(if use_cache { self.layers.len() } else { 0 });
        for (idx, layer) in self.layers.iter().enumerate() {
            let layer_past = past.and_then(|cache| cache.layer(idx));
            let (next, cache) = layer.forward(&hidden, mask.as_ref(), layer_past, use_cache)?;
            hidden = next;
            caches.extend(cache);
        }

        let normed = self.output_norm.forward(&hidden, &self.policy)?;
        let logits = self.de_embedding_proj.forward(&normed, &self.policy)?;
        let logits = self.policy.cast_logits(&logits)?;

        let cache = if use_cache {
            Some(ModelCache::new(caches)?)
        } else {
            None
        };
        Ok((logits, cache))
    }

    /// Every trainable parameter in module order.
    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        let mut params = self.embedding_proj.named_parameters("embedding_proj");
        for (idx, layer) in self.layers.iter().enumerate() {
            params.extend(layer.named_parameters(&format!("layers.{idx}")));
        }
        params.extend(self.output_norm.named_parameters("output_norm"));
        params.extend(self.de_embedding_proj.named_parameters("de_embedding_proj"));
        params
    }

    pub fn num_parameters(&self) -> usize {
        self.named_parameters()
            .iter()
            .map(|(_, var)| var.elem_count())
            .sum()
    }

    /// Snapshot of the parameter tensors keyed by `{prefix}{name}`.
    pub fn parameter_map(&self, prefix: &str) -> HashMap<String, Tensor> {
        self.named_parameters()
            .into_iter()
            .map(|(name, var)| (format!("{prefix}{name}"), var.as_tensor().clone()))
            .collect()
    }

    /// Copies `{prefix}{name}` entries of `tensors` into the matching parameters.
    ///
    /// Every parameter must be present with its exact shape; extra entries are
    /// ignored.
    pub fn load_parameters(&self, prefix: &str, tensors: &HashMap<String, Tensor>) -> Result<()> {
        for (name, var) in self.named_parameters() {
            let key = format!("{prefix}{name}");
            let source = tensors
                .get(&key)
                .ok_or_else(|| ModelError::Parameter(format!("missing parameter '{key}'")))?;
            if source.dims() != var.dims() {
                return Err(ModelError::Parameter(format!(
                    "parameter '{key}' expects shape {:?}, got {:?}",
                    var.dims(),
                    source.dims()
                )));
            }
            var.set(&source.to_dtype(var.dtype())?)?;
        }
        log::debug!("loaded {} parameters with prefix '{prefix}'", tensors.len());
        Ok(())
    }

    /// Builds the portable wrapper with this model's configuration and weights.
    pub fn to_portable(&self) -> Result<PortableModel> {
        let config = PortableConfig::from_model_config(&self.config);
        let portable = PortableModel::with_context(config, &self.context)?;
        portable.load_parameters(&self.parameter_map(PortableModel::PARAMETER_PREFIX))?;
        Ok(portable)
    }
}
