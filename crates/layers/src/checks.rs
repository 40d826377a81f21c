//! Lightweight validation helpers shared across layer components.
//!
//! Every helper takes a `label` naming the tensor under test so failures point
//! at the offending parameter or activation. They return
//! `candle_core::Result<()>` so call sites can propagate with `?`.

use candle_core::{bail, DType, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(label: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() != expected {
        bail!(
            "{label}: expected shape {:?}, got {:?}",
            expected,
            tensor.dims()
        );
    }
    Ok(())
}

/// Ensures a tensor has the given rank.
pub fn expect_rank(label: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() != rank {
        bail!(
            "{label}: expected rank {rank}, got shape {:?}",
            tensor.dims()
        );
    }
    Ok(())
}

/// Validates the `(batch, seq, hidden)` convention with a known hidden size.
pub fn expect_batch_seq_hidden(label: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims() {
        [batch, seq, actual] if *actual == hidden && *batch > 0 && *seq > 0 => Ok(()),
        dims => bail!("{label}: expected (batch, seq, {hidden}) layout, got {:?}", dims),
    }
}

/// Validates that the trailing axis has the expected width.
pub fn expect_last_dim(label: &str, tensor: &Tensor, width: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(actual) if *actual == width => Ok(()),
        _ => bail!(
            "{label}: expected trailing dim {width}, got shape {:?}",
            tensor.dims()
        ),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(label: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if !allowed.contains(&dtype) {
        bail!("{label}: expected dtype in {:?}, got {:?}", allowed, dtype);
    }
    Ok(())
}

/// Floating point dtypes accepted for parameters and activations.
pub const FLOAT_DTYPES: &[DType] = &[DType::F16, DType::BF16, DType::F32];
