//! Embedding crate
//!
//! Token lookup tables and rotary positional embeddings for the decoder.

pub mod positional;
pub mod token;

pub use positional::*;
pub use token::*;
