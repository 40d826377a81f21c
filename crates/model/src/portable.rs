//! Interchange form of the pico model.
//!
//! [`PortableConfig`] is a flat key/value configuration: the typed
//! hyperparameters plus a `model_type` tag and a side-table for keys this crate
//! does not know. [`PortableModel`] wraps a [`Model`] behind that configuration
//! and exposes its parameters under the `pico.` prefix.

use std::collections::{BTreeMap, HashMap};

use attention::ModelCache;
use candle_core::{Tensor, Var};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    config::{ModelConfig, ModelHyperparameters},
    context::DeviceContext,
    error::{ModelError, Result},
    model::Model,
};

pub const MODEL_TYPE: &str = "pico";

fn default_model_type() -> String {
    MODEL_TYPE.to_owned()
}

/// Flat configuration understood by downstream interchange tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortableConfig {
    #[serde(default = "default_model_type")]
    pub model_type: String,
    #[serde(flatten)]
    pub hyperparameters: ModelConfig,
    /// Keys with no typed counterpart, kept verbatim.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for PortableConfig {
    fn default() -> Self {
        Self::from_model_config(&ModelConfig::default())
    }
}

impl PortableConfig {
    /// Field-for-field copy of a native configuration.
    pub fn from_model_config(config: &ModelConfig) -> Self {
        Self {
            model_type: default_model_type(),
            hyperparameters: config.clone(),
            extra: BTreeMap::new(),
        }
    }

    /// Starts from the defaults and applies every entry of `dict`.
    pub fn from_dict(dict: &Map<String, Value>) -> Result<Self> {
        let mut config = Self::default();
        for (key, value) in dict {
            config.set(key, value.clone())?;
        }
        Ok(config)
    }

    /// Like [`from_dict`](Self::from_dict), but `kwargs` are applied first and
    /// only when they name a known field. The kwargs that were not consumed are
    /// returned alongside the configuration.
    pub fn from_dict_with_kwargs(
        dict: &Map<String, Value>,
        kwargs: &Map<String, Value>,
    ) -> Result<(Self, Map<String, Value>)> {
        let mut config = Self::default();
        let mut unused = Map::new();
        for (key, value) in kwargs {
            if Self::is_known_field(key) {
                config.set(key, value.clone())?;
            } else {
                unused.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in dict {
            config.set(key, value.clone())?;
        }
        if !unused.is_empty() {
            log::debug!(
                "unused portable config kwargs: {:?}",
                unused.keys().collect::<Vec<_>>()
            );
        }
        Ok((config, unused))
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        match serde_json::from_str::<Value>(json)? {
            Value::Object(dict) => Self::from_dict(&dict),
            other => Err(ModelError::ConfigFormat(format!(
                "portable config must be a JSON object, got {other}"
            ))),
        }
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.to_dict()?)?)
    }

    fn is_known_field(key: &str) -> bool {
        matches!(
            key,
            "model_type"
                | "d_model"
                | "n_layers"
                | "vocab_size"
                | "batch_size"
                | "max_seq_len"
                | "attention_n_heads"
                | "attention_n_kv_heads"
                | "activation_hidden_dim"
                | "norm_eps"
                | "position_emb_theta"
        )
    }

    /// Assigns one entry: typed fields are parsed, anything else lands in `extra`.
    pub fn set(&mut self, key: &str, value: Value) -> Result<()> {
        let hp = &mut self.hyperparameters;
        match key {
            "model_type" => self.model_type = parse_field(key, value)?,
            "d_model" => hp.d_model = parse_field(key, value)?,
            "n_layers" => hp.n_layers = parse_field(key, value)?,
            "vocab_size" => hp.vocab_size = parse_field(key, value)?,
            "batch_size" => hp.batch_size = parse_field(key, value)?,
            "max_seq_len" => hp.max_seq_len = parse_field(key, value)?,
            "attention_n_heads" => hp.attention_n_heads = parse_field(key, value)?,
            "attention_n_kv_heads" => hp.attention_n_kv_heads = parse_field(key, value)?,
            "activation_hidden_dim" => hp.activation_hidden_dim = parse_field(key, value)?,
            "norm_eps" => hp.norm_eps = parse_field(key, value)?,
            "position_emb_theta" => hp.position_emb_theta = parse_field(key, value)?,
            _ => {
                self.extra.insert(key.to_owned(), value);
            }
        }
        Ok(())
    }

    /// Flat JSON object holding `model_type`, every typed field and the extras.
    pub fn to_dict(&self) -> Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            other => Err(ModelError::ConfigFormat(format!(
                "portable config serialised to a non-object value: {other}"
            ))),
        }
    }

    pub fn to_model_config(&self) -> ModelConfig {
        self.hyperparameters.clone()
    }
}

fn parse_field<T: DeserializeOwned>(key: &str, value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|err| ModelError::ConfigFormat(format!("field '{key}': {err}")))
}

impl ModelHyperparameters for PortableConfig {
    fn d_model(&self) -> usize {
        self.hyperparameters.d_model
    }
    fn n_layers(&self) -> usize {
        self.hyperparameters.n_layers
    }
    fn attention_n_heads(&self) -> usize {
        self.hyperparameters.attention_n_heads
    }
    fn attention_n_kv_heads(&self) -> usize {
        self.hyperparameters.attention_n_kv_heads
    }
    fn max_seq_len(&self) -> usize {
        self.hyperparameters.max_seq_len
    }
    fn vocab_size(&self) -> usize {
        self.hyperparameters.vocab_size
    }
    fn norm_eps(&self) -> f64 {
        self.hyperparameters.norm_eps
    }
    fn position_emb_theta(&self) -> f64 {
        self.hyperparameters.position_emb_theta
    }
    fn activation_hidden_dim(&self) -> usize {
        self.hyperparameters.activation_hidden_dim
    }
    fn batch_size(&self) -> usize {
        self.hyperparameters.batch_size
    }
}

/// Result of a portable forward pass.
#[derive(Debug, Clone)]
pub struct PortableOutput {
    /// f32 logits `[batch, seq, vocab_size]`.
    pub logits: Tensor,
    /// Present exactly when the call asked for a cache.
    pub model_cache: Option<ModelCache>,
}

#[derive(Debug)]
pub struct PortableModel {
    config: PortableConfig,
    pico: Model,
}

impl PortableModel {
    pub const PARAMETER_PREFIX: &'static str = "pico.";

    pub fn new(config: PortableConfig) -> Result<Self> {
        Self::with_context(config, &DeviceContext::default())
    }

    pub fn with_context(config: PortableConfig, context: &DeviceContext) -> Result<Self> {
        let pico = Model::with_context(&config, context)?;
        Ok(Self { config, pico })
    }

    pub fn config(&self) -> &PortableConfig {
        &self.config
    }

    pub fn pico(&self) -> &Model {
        &self.pico
    }

    /// Runs the wrapped model. Entries in `extra` are accepted and ignored.
    pub fn forward(
        &self,
        token_ids: &Tensor,
        past: Option<&ModelCache>,
        use_cache: bool,
        extra: &Map<String, Value>,
    ) -> Result<PortableOutput> {
        if !extra.is_empty() {
            log::trace!(
                "ignoring portable forward arguments: {:?}",
                extra.keys().collect::<Vec<_>>()
            );
        }
        let (logits, model_cache) = self.pico.forward(token_ids, past, use_cache)?;
        Ok(PortableOutput {
            logits,
            model_cache,
        })
    }

    /// Parameters named `pico.{native name}`.
    pub fn named_parameters(&self) -> Vec<(String, Var)> {
        self.pico
            .named_parameters()
            .into_iter()
            .map(|(name, var)| (format!("{}{name}", Self::PARAMETER_PREFIX), var))
            .collect()
    }

    pub fn parameter_map(&self) -> HashMap<String, Tensor> {
        self.pico.parameter_map(Self::PARAMETER_PREFIX)
    }

    pub fn load_parameters(&self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        self.pico.load_parameters(Self::PARAMETER_PREFIX, tensors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn dict_entries_land_in_typed_fields_or_extra() {
        let config = PortableConfig::from_dict(&object(json!({
            "d_model": 16,
            "norm_eps": 1e-5,
            "tokenizer_name": "byte-level",
        })))
        .unwrap();
        assert_eq!(config.hyperparameters.d_model, 16);
        assert_eq!(config.hyperparameters.norm_eps, 1e-5);
        assert_eq!(config.hyperparameters.n_layers, ModelConfig::default().n_layers);
        assert_eq!(config.extra["tokenizer_name"], json!("byte-level"));
        assert_eq!(config.model_type, MODEL_TYPE);
    }

    #[test]
    fn mistyped_field_is_a_format_error() {
        let err = PortableConfig::from_dict(&object(json!({ "n_layers": "four" }))).unwrap_err();
        assert!(matches!(err, ModelError::ConfigFormat(msg) if msg.contains("n_layers")));
    }

    #[test]
    fn to_dict_is_flat() {
        let mut config = PortableConfig::default();
        config.set("run_name", json!("tiny")).unwrap();
        let dict = config.to_dict().unwrap();
        assert_eq!(dict["model_type"], json!("pico"));
        assert_eq!(dict["d_model"], json!(768));
        assert_eq!(dict["run_name"], json!("tiny"));
        assert!(!dict.contains_key("hyperparameters"));
        assert!(!dict.contains_key("extra"));
    }

    #[test]
    fn serde_deserialize_splits_known_and_unknown_keys() {
        let config: PortableConfig = serde_json::from_value(json!({
            "d_model": 32,
            "attention_n_heads": 4,
            "note": [1, 2],
        }))
        .unwrap();
        assert_eq!(config.hyperparameters.d_model, 32);
        assert_eq!(config.model_type, "pico");
        assert_eq!(config.extra.len(), 1);
        assert_eq!(config.extra["note"], json!([1, 2]));
    }
}
