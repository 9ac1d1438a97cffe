//! Mask utilities shared by attention implementations.
//!
//! Two mask encodings are accepted everywhere a mask is taken:
//!
//! * boolean masks with dtype [`BOOL_MASK_DTYPE`], where a non-zero entry
//!   forbids attending to the position;
//! * additive float masks whose values are added to the attention scores,
//!   `0.0` to keep and `f32::NEG_INFINITY` to discard.
//!
//! [`to_additive`] folds both encodings into the additive form.

pub mod causal;
pub mod padding;

use candle_core::{DType, Error, Result, Tensor};

/// Dtype of additive masks built by this module.
pub const MASK_DTYPE: DType = DType::F32;

/// Dtype of boolean masks.
pub const BOOL_MASK_DTYPE: DType = DType::U8;

pub use causal::build_causal_mask;
pub use padding::{padding_mask_from_booleans, padding_mask_from_lengths};

/// Converts a boolean or additive mask to an additive mask of `dtype`.
pub fn to_additive(mask: &Tensor, dtype: DType) -> Result<Tensor> {
    match mask.dtype() {
        BOOL_MASK_DTYPE => {
            let device = mask.device();
            let blocked = Tensor::full(f32::NEG_INFINITY, mask.shape(), device)?.to_dtype(dtype)?;
            let open = Tensor::zeros(mask.shape(), dtype, device)?;
            mask.where_cond(&blocked, &open)
        }
        other if other.is_float() => mask.to_dtype(dtype),
        other => Err(Error::Msg(format!(
            "masks must be u8 (boolean) or floating point, got {other:?}"
        ))),
    }
}
