//! Causal grouped-query attention primitives for the pico decoder.
//!
//! The kernels compute causal self-attention over tensors with layout
//! `[batch, heads, seq_len, head_dim]`, where several query heads may share one
//! key/value head. Reductions are performed internally in `f32`, and the output
//! tensor matches the query dtype and shape.
//!
//! Key/value caches are plain values: every decoding step returns a new
//! [`kv_cache::LayerCache`] holding the concatenated history, and the caller
//! decides whether to keep it.

pub mod core;
pub mod grouped;
pub mod kv_cache;
pub mod masks;
pub mod reference;

pub use core::{Attention, AttentionError, Config};
pub use grouped::repeat_kv;
pub use kv_cache::{LayerCache, ModelCache};
pub use reference::ExactAttention;
