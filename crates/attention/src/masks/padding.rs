//! Builders for boolean padding masks used to drop padded keys.
//!
//! Masks are `(batch, k_len)` with dtype [`BOOL_MASK_DTYPE`](super::BOOL_MASK_DTYPE);
//! `1` marks a padded position.

use candle_core::{Device, Error, Result, Tensor};

/// Construct padding masks from per-batch valid key lengths.
///
/// Lengths beyond `k_len` are clamped.
pub fn padding_mask_from_lengths(device: &Device, key_lengths: &[usize], k_len: usize) -> Result<Tensor> {
    let data: Vec<u8> = key_lengths
        .iter()
        .flat_map(|&valid| (0..k_len).map(move |k| u8::from(k >= valid)))
        .collect();
    Tensor::from_vec(data, (key_lengths.len(), k_len), device)
}

/// Construct padding masks from boolean padding indicators.
///
/// Each inner slice corresponds to a batch element and must share the same
/// length. `true` indicates a padded (masked) key position.
pub fn padding_mask_from_booleans(device: &Device, padding: &[Vec<bool>]) -> Result<Tensor> {
    let k_len = padding.first().map_or(0, Vec::len);
    if let Some(row) = padding.iter().position(|mask| mask.len() != k_len) {
        return Err(Error::Msg(format!(
            "padding row {row} has length {}, expected {k_len}",
            padding[row].len()
        )));
    }
    let data: Vec<u8> = padding
        .iter()
        .flat_map(|mask| mask.iter().map(|&padded| u8::from(padded)))
        .collect();
    Tensor::from_vec(data, (padding.len(), k_len), device)
}
