//! Key/value cache values for incremental decoding.
//!
//! A [`LayerCache`] stores the projected keys and values of one attention layer
//! laid out `[batch, seq, n_kv_heads, head_dim]`. Caches never change in place:
//! [`LayerCache::append`] returns a new value holding the concatenated history.
//! [`ModelCache`] bundles one layer cache per decoder layer and guarantees they
//! agree on batch size and accumulated length.

use candle_core::Tensor;

use crate::core::AttentionError;

/// Accumulated keys and values of a single attention layer.
#[derive(Debug, Clone)]
pub struct LayerCache {
    keys: Tensor,
    values: Tensor,
}

impl LayerCache {
    /// Wraps `[batch, seq, n_kv_heads, head_dim]` keys and values of identical shape.
    pub fn new(keys: Tensor, values: Tensor) -> Result<Self, AttentionError> {
        if keys.rank() != 4 {
            return Err(AttentionError::InvalidShape {
                context: format!(
                    "cache keys must be [batch, seq, kv_heads, head_dim], got {:?}",
                    keys.dims()
                ),
            });
        }
        if keys.dims() != values.dims() {
            return Err(AttentionError::CacheMismatch(format!(
                "keys {:?} and values {:?} differ in shape",
                keys.dims(),
                values.dims()
            )));
        }
        if keys.dtype() != values.dtype() {
            return Err(AttentionError::CacheMismatch(format!(
                "keys {:?} and values {:?} differ in dtype",
                keys.dtype(),
                values.dtype()
            )));
        }
        Ok(Self { keys, values })
    }

    pub fn keys(&self) -> &Tensor {
        &self.keys
    }

    pub fn values(&self) -> &Tensor {
        &self.values
    }

    pub fn batch(&self) -> usize {
        self.keys.dims()[0]
    }

    /// Number of positions accumulated so far.
    pub fn seq_len(&self) -> usize {
        self.keys.dims()[1]
    }

    pub fn kv_heads(&self) -> usize {
        self.keys.dims()[2]
    }

    pub fn head_dim(&self) -> usize {
        self.keys.dims()[3]
    }

    /// Returns a new cache with `keys`/`values` concatenated after the stored history.
    pub fn append(&self, keys: &Tensor, values: &Tensor) -> Result<Self, AttentionError> {
        let step = Self::new(keys.clone(), values.clone())?;
        self.ensure_compatible(&step)?;
        let keys = Tensor::cat(&[&self.keys, &step.keys], 1)?;
        let values = Tensor::cat(&[&self.values, &step.values], 1)?;
        log::debug!(
            "kv cache grew from {} to {} positions",
            self.seq_len(),
            keys.dims()[1]
        );
        Ok(Self { keys, values })
    }

    pub fn into_parts(self) -> (Tensor, Tensor) {
        (self.keys, self.values)
    }

    fn ensure_compatible(&self, other: &Self) -> Result<(), AttentionError> {
        let ours = (self.batch(), self.kv_heads(), self.head_dim());
        let theirs = (other.batch(), other.kv_heads(), other.head_dim());
        if ours != theirs {
            return Err(AttentionError::CacheMismatch(format!(
                "cached (batch, kv_heads, head_dim) {ours:?} does not match new {theirs:?}"
            )));
        }
        if self.keys.dtype() != other.keys.dtype() {
            return Err(AttentionError::CacheMismatch(format!(
                "cached dtype {:?} does not match new {:?}",
                self.keys.dtype(),
                other.keys.dtype()
            )));
        }
        Ok(())
    }
}

/// One [`LayerCache`] per decoder layer, in layer order.
#[derive(Debug, Clone)]
pub struct ModelCache {
    layers: Vec<LayerCache>,
}

impl ModelCache {
    /// Bundles per-layer caches that share batch size and accumulated length.
    pub fn new(layers: Vec<LayerCache>) -> Result<Self, AttentionError> {
        let Some(first) = layers.first() else {
            return Err(AttentionError::CacheMismatch(
                "model cache needs at least one layer".into(),
            ));
        };
        let (batch, seq_len) = (first.batch(), first.seq_len());
        for (idx, layer) in layers.iter().enumerate().skip(1) {
            if layer.seq_len() != seq_len {
                return Err(AttentionError::CacheMismatch(format!(
                    "layer {idx} holds {} positions but layer 0 holds {seq_len}",
                    layer.seq_len()
                )));
            }
            if layer.batch() != batch {
                return Err(AttentionError::CacheMismatch(format!(
                    "layer {idx} has batch {} but layer 0 has {batch}",
                    layer.batch()
                )));
            }
        }
        Ok(Self { layers })
    }

    /// Number of layers.
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Accumulated sequence length shared by every layer.
    pub fn seq_len(&self) -> usize {
        self.layers[0].seq_len()
    }

    pub fn batch(&self) -> usize {
        self.layers[0].batch()
    }

    pub fn layer(&self, index: usize) -> Option<&LayerCache> {
        self.layers.get(index)
    }

    pub fn layers(&self) -> &[LayerCache] {
        &self.layers
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LayerCache> {
        self.layers.iter()
    }

    pub fn into_layers(self) -> Vec<LayerCache> {
        self.layers
    }
}

impl<'a> IntoIterator for &'a ModelCache {
    type Item = &'a LayerCache;
    type IntoIter = std::slice::Iter<'a, LayerCache>;

    fn into_iter(self) -> Self::IntoIter {
        self.layers.iter()
    }
}
