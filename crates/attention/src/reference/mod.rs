//! Exact softmax attention computed with dense matmuls.
//!
//! Grouped key/value heads are expanded with [`repeat_kv`](crate::repeat_kv)
//! before scoring, so one kernel serves multi-head, grouped and multi-query
//! layouts.

pub mod exact;

pub use exact::ExactAttention;
