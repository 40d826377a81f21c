//! Building blocks for transformer layers.
//!
//! This crate hosts the bias-free projections, RMS normalisation and the
//! SwiGLU feed-forward block assembled into decoder layers. All layers follow
//! the `(batch, seq, hidden)` convention and route their casts through
//! [`dtypes::PrecisionPolicy`].

pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;

pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit};
pub use mlp::{FeedForwardConfig, SwiGlu};
pub use norm::{NormConfig, RmsNorm};
