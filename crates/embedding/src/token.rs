//! Learned token lookup table (`embedding_proj`).

use candle_core::{bail, DType, Device, Result, Tensor, Var};

#[derive(Debug, Clone)]
pub struct TokenEmbeddingConfig {
    pub vocab_size: usize,
    pub hidden_dim: usize,
    /// Storage dtype of the table and of the looked-up rows.
    pub dtype: DType,
    pub device: Device,
}

/// `(vocab_size, hidden_dim)` table indexed by token id.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    config: TokenEmbeddingConfig,
    weight: Var,
}

impl TokenEmbedding {
    /// Rows are drawn from `N(0, 1)`.
    pub fn new(config: TokenEmbeddingConfig) -> Result<Self> {
        if config.vocab_size == 0 {
            bail!("vocab_size must be non-zero");
        }
        if config.hidden_dim == 0 {
            bail!("hidden_dim must be non-zero");
        }

        let shape = (config.vocab_size, config.hidden_dim);
        let initial = Tensor::randn(0f32, 1f32, shape, &config.device)?.to_dtype(config.dtype)?;
        let weight = Var::from_tensor(&initial)?;
        Ok(Self { config, weight })
    }

    pub fn config(&self) -> &TokenEmbeddingConfig {
        &self.config
    }

    /// Returns the weight variable shaped `(vocab_size, hidden_dim)`.
    pub fn weight(&self) -> &Var {
        &self.weight
    }

    /// Maps integer ids `(batch, seq)` to rows `(batch, seq, hidden_dim)`.
    ///
    /// Every id must lie in `0..vocab_size`.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        let (batch, seq) = self.validate_token_ids(token_ids)?;

        let flat = token_ids.to_dtype(DType::I64)?.flatten_all()?;
        self.ensure_id_range(&flat)?;

        self.weight
            .as_tensor()
            .index_select(&flat, 0)?
            .reshape((batch, seq, self.config.hidden_dim))
    }

    /// Lists `{scope}.weight`.
    pub fn named_parameters(&self, scope: &str) -> Vec<(String, Var)> {
        vec![(format!("{scope}.weight"), self.weight.clone())]
    }

    fn validate_token_ids(&self, token_ids: &Tensor) -> Result<(usize, usize)> {
        let (batch, seq) = match token_ids.dims() {
            [batch, seq] => (*batch, *seq),
            dims => bail!("token_ids must be shaped [batch, seq], got {:?}", dims),
        };
        if batch == 0 || seq == 0 {
            bail!("token_ids must have non-zero batch and seq dimensions");
        }
        if !token_ids.dtype().is_int() {
            bail!(
                "token ids must be integers, got {:?}",
                token_ids.dtype()
            );
        }
        Ok((batch, seq))
    }

    fn ensure_id_range(&self, flat_ids: &Tensor) -> Result<()> {
        let vocab = self.config.vocab_size as i64;
        let (lo, hi) = (
            flat_ids.min_all()?.to_scalar::<i64>()?,
            flat_ids.max_all()?.to_scalar::<i64>()?,
        );
        if lo < 0 || hi >= vocab {
            bail!("token ids span {lo}..={hi}, outside vocabulary 0..{vocab}");
        }
        Ok(())
    }
}
