//! Lightweight validation helpers shared across layer components.
//!
//! Every check takes a `context` label naming the tensor under inspection
//! (e.g. `"ffn.inner_proj.weight"`) so that failures point at the offending
//! parameter or argument. They return `candle_core::Result<()>` so call sites
//! can propagate errors without panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(context: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected shape {expected:?}, got {actual:?}"
        )))
    }
}

/// Ensures a tensor has the expected rank.
pub fn expect_rank(context: &str, tensor: &Tensor, rank: usize) -> Result<()> {
    if tensor.rank() == rank {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected rank {rank}, got shape {:?}",
            tensor.dims()
        )))
    }
}

/// Validates that the trailing (model) dimension equals `hidden`, for any rank >= 1.
pub fn expect_last_dim(context: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(&last) if last == hidden => Ok(()),
        _ => Err(Error::Msg(format!(
            "{context}: expected trailing dimension {hidden}, got {:?}",
            tensor.dims()
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(context: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected dtype in {allowed:?}, got {dtype:?}"
        )))
    }
}

/// Ensures two tensors share a dtype.
pub fn expect_same_dtype(
    context: &str,
    tensor: &Tensor,
    other_context: &str,
    other: &Tensor,
) -> Result<()> {
    if tensor.dtype() == other.dtype() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context} has dtype {:?} but {other_context} has dtype {:?}",
            tensor.dtype(),
            other.dtype()
        )))
    }
}

/// Parameters are expected to be laid out contiguously.
pub fn expect_contiguous(context: &str, tensor: &Tensor) -> Result<()> {
    if tensor.is_contiguous() {
        Ok(())
    } else {
        Err(Error::Msg(format!("{context}: tensor must be contiguous")))
    }
}

/// Guards casts between floating dtypes; integer targets are rejected.
pub fn ensure_cast_supported(context: &str, from: DType, to: DType) -> Result<()> {
    if from.is_float() && to.is_float() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: unsupported cast from {from:?} to {to:?}"
        )))
    }
}
