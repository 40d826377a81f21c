//! The pico decoder-only transformer.
//!
//! [`Model`] stacks [`DecoderBlock`]s between a token embedding and a
//! vocabulary projection and supports incremental decoding through
//! [`attention::ModelCache`]. [`PortableModel`] wraps the same network behind a
//! flat interchange configuration.

pub mod block;
pub mod config;
pub mod context;
pub mod error;
pub mod model;
pub mod portable;
pub mod self_attention;

pub use attention::{LayerCache, ModelCache};
pub use block::DecoderBlock;
pub use config::{ModelConfig, ModelHyperparameters};
pub use context::DeviceContext;
pub use error::{ModelError, Result};
pub use model::Model;
pub use portable::{PortableConfig, PortableModel, PortableOutput};
pub use self_attention::AttentionBlock;
