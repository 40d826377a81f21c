use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// Read-only view of the decoder hyperparameters.
///
/// Implemented by the native [`ModelConfig`] and by
/// [`PortableConfig`](crate::portable::PortableConfig), so the model can be
/// built from either representation.
pub trait ModelHyperparameters {
    fn d_model(&self) -> usize;
    fn n_layers(&self) -> usize;
    fn attention_n_heads(&self) -> usize;
    fn attention_n_kv_heads(&self) -> usize;
    fn max_seq_len(&self) -> usize;
    fn vocab_size(&self) -> usize;
    fn norm_eps(&self) -> f64;
    fn position_emb_theta(&self) -> f64;
    fn activation_hidden_dim(&self) -> usize;
    fn batch_size(&self) -> usize;

    fn head_dim(&self) -> usize {
        self.d_model() / self.attention_n_heads().max(1)
    }

    /// Checks every structural invariant and reports all violations at once.
    fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        for (name, value) in [
            ("d_model", self.d_model()),
            ("n_layers", self.n_layers()),
            ("attention_n_heads", self.attention_n_heads()),
            ("attention_n_kv_heads", self.attention_n_kv_heads()),
            ("max_seq_len", self.max_seq_len()),
            ("vocab_size", self.vocab_size()),
            ("activation_hidden_dim", self.activation_hidden_dim()),
            ("batch_size", self.batch_size()),
        ] {
            if value == 0 {
                errors.push(format!("{name} must be greater than 0"));
            }
        }

        let (d_model, heads, kv_heads) = (
            self.d_model(),
            self.attention_n_heads(),
            self.attention_n_kv_heads(),
        );
        if heads > 0 && d_model % heads != 0 {
            errors.push(format!(
                "d_model ({d_model}) must be divisible by attention_n_heads ({heads})"
            ));
        } else if heads > 0 && self.head_dim() % 2 != 0 {
            errors.push(format!(
                "head_dim ({}) must be even for rotary embeddings",
                self.head_dim()
            ));
        }
        if kv_heads > 0 && heads % kv_heads != 0 {
            errors.push(format!(
                "attention_n_heads ({heads}) must be divisible by attention_n_kv_heads ({kv_heads})"
            ));
        }
        if self.norm_eps().is_nan() || self.norm_eps() <= 0.0 {
            errors.push("norm_eps must be greater than 0".to_string());
        }
        if !(self.position_emb_theta().is_finite() && self.position_emb_theta() > 0.0) {
            errors.push("position_emb_theta must be finite and greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ModelError::InvalidConfig(errors))
        }
    }
}

/// Native hyperparameters of the pico decoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub d_model: usize,
    pub n_layers: usize,
    pub vocab_size: usize,
    pub batch_size: usize,
    pub max_seq_len: usize,
    pub attention_n_heads: usize,
    pub attention_n_kv_heads: usize,
    pub activation_hidden_dim: usize,
    pub norm_eps: f64,
    pub position_emb_theta: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            d_model: 768,
            n_layers: 12,
            vocab_size: 50304,
            batch_size: 1024,
            max_seq_len: 2048,
            attention_n_heads: 12,
            attention_n_kv_heads: 4,
            activation_hidden_dim: 3072,
            norm_eps: 1e-6,
            position_emb_theta: 10000.0,
        }
    }
}

impl ModelConfig {
    /// Loads a `.json` or `.toml` file; missing fields take the defaults.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: ModelConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(ModelError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Copies every field out of any hyperparameter source.
    pub fn from_hyperparameters(source: &impl ModelHyperparameters) -> Self {
        Self {
            d_model: source.d_model(),
            n_layers: source.n_layers(),
            vocab_size: source.vocab_size(),
            batch_size: source.batch_size(),
            max_seq_len: source.max_seq_len(),
            attention_n_heads: source.attention_n_heads(),
            attention_n_kv_heads: source.attention_n_kv_heads(),
            activation_hidden_dim: source.activation_hidden_dim(),
            norm_eps: source.norm_eps(),
            position_emb_theta: source.position_emb_theta(),
        }
    }
}

impl ModelHyperparameters for ModelConfig {
    fn d_model(&self) -> usize {
        self.d_model
    }
    fn n_layers(&self) -> usize {
        self.n_layers
    }
    fn attention_n_heads(&self) -> usize {
        self.attention_n_heads
    }
    fn attention_n_kv_heads(&self) -> usize {
        self.attention_n_kv_heads
    }
    fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }
    fn vocab_size(&self) -> usize {
        self.vocab_size
    }
    fn norm_eps(&self) -> f64 {
        self.norm_eps
    }
    fn position_emb_theta(&self) -> f64 {
        self.position_emb_theta
    }
    fn activation_hidden_dim(&self) -> usize {
        self.activation_hidden_dim
    }
    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ModelConfig::default();
        config.validate().unwrap();
        assert_eq!(config.head_dim(), 64);
    }

    #[test]
    fn validation_collects_every_violation() {
        let config = ModelConfig {
            d_model: 10,
            attention_n_heads: 4,
            attention_n_kv_heads: 3,
            vocab_size: 0,
            norm_eps: 0.0,
            ..ModelConfig::default()
        };
        match config.validate() {
            Err(ModelError::InvalidConfig(errors)) => {
                assert_eq!(errors.len(), 4, "{errors:?}");
                assert!(errors.iter().any(|e| e.contains("vocab_size")));
                assert!(errors.iter().any(|e| e.contains("divisible by attention_n_heads")));
                assert!(errors.iter().any(|e| e.contains("attention_n_kv_heads (3)")));
                assert!(errors.iter().any(|e| e.contains("norm_eps")));
            }
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn odd_head_dim_is_rejected() {
        let config = ModelConfig {
            d_model: 6,
            attention_n_heads: 2,
            attention_n_kv_heads: 1,
            ..ModelConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
