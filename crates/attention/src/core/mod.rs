//! Core traits and types shared across attention implementations.
//!
//! Implementations operate on `(batch, seq, model_dim)` tensors. Queries and
//! keys may have different sequence lengths; the output always mirrors the
//! query shape and dtype.

pub mod config;
pub mod errors;

use candle_core::Tensor;

use crate::kv_cache::IncrementalStateBag;

pub use config::Config;
pub use errors::AttentionError;

/// Unified interface for multi-head attention modules.
///
/// * `query` is `(batch, q_len, model_dim)`; `keys` and `values` are
///   `(batch, k_len, model_dim)`.
/// * `attn_mask` is an additive float or boolean (`u8`, non-zero = forbidden)
///   mask shaped `(q_len, k_total)`, where `k_total` includes cached positions.
/// * `padding_mask` is `(batch, k_len)` over the keys supplied in this call,
///   boolean or additive like `attn_mask`.
/// * When a `state_bag` is supplied the module may read and extend cached
///   projected keys and values stored under its own identity. Callers own the
///   bag and advance its step counter.
pub trait Attention: Send + Sync {
    /// Model dimension of inputs and outputs.
    fn model_dim(&self) -> usize;

    /// Attend `query` over `keys`/`values`.
    fn attend(
        &self,
        query: &Tensor,
        keys: &Tensor,
        values: &Tensor,
        attn_mask: Option<&Tensor>,
        padding_mask: Option<&Tensor>,
        state_bag: Option<&mut IncrementalStateBag>,
    ) -> Result<Tensor, AttentionError>;

    /// Switches between training and evaluation behaviour.
    fn set_training(&self, _training: bool) {}
}
