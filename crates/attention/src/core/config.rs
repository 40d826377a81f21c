//! Head geometry shared by attention implementations.
//!
//! [`Config`] fixes how many query heads share each key/value head. It is
//! validated once at construction so kernels can rely on the ratio.

use super::AttentionError;

/// Head layout for grouped-query attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Number of query heads.
    pub n_heads: usize,
    /// Number of key/value heads; each serves `n_heads / n_kv_heads` query heads.
    pub n_kv_heads: usize,
    /// Per-head feature width.
    pub head_dim: usize,
}

impl Config {
    pub fn new(n_heads: usize, n_kv_heads: usize, head_dim: usize) -> Result<Self, AttentionError> {
        if n_heads == 0 || n_kv_heads == 0 || head_dim == 0 {
            return Err(AttentionError::InvalidConfig(format!(
                "head counts and head_dim must be non-zero (n_heads={n_heads}, n_kv_heads={n_kv_heads}, head_dim={head_dim})"
            )));
        }
        if n_heads % n_kv_heads != 0 {
            return Err(AttentionError::InvalidConfig(format!(
                "n_heads ({n_heads}) must be a multiple of n_kv_heads ({n_kv_heads})"
            )));
        }
        Ok(Self {
            n_heads,
            n_kv_heads,
            head_dim,
        })
    }

    /// Query heads served by one key/value head.
    pub fn group_size(&self) -> usize {
        self.n_heads / self.n_kv_heads
    }

    /// Score scale `1 / sqrt(head_dim)`.
    pub fn scale(&self) -> f64 {
        1.0 / (self.head_dim as f64).sqrt()
    }
}
