//! Per-module cached attention state.

use std::sync::atomic::{AtomicU64, Ordering};

use candle_core::Tensor;

static NEXT_MODULE_ID: AtomicU64 = AtomicU64::new(0);

/// Identity under which an attention module stores its cache in a bag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(u64);

impl ModuleId {
    /// Allocates an identity that no other module in the process shares.
    pub fn fresh() -> Self {
        Self(NEXT_MODULE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value, for logging.
    pub fn get(self) -> u64 {
        self.0
    }
}

/// How a module's projected keys and values evolve across decoding steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    /// Self-attention: each step appends the projections of its new positions.
    Appending,
    /// Encoder-decoder attention: projections are computed once per session.
    Static,
}

/// Projected keys and values cached by one attention module.
///
/// `keys` and `values` are `(batch, heads, k_len, head_dim)`. `key_padding` is
/// the additive `(batch, k_len)` mask of the cached positions, if any call
/// supplied one.
#[derive(Debug, Clone)]
pub struct AttentionState {
    keys: Tensor,
    values: Tensor,
    key_padding: Option<Tensor>,
    last_step: usize,
}

impl AttentionState {
    pub fn new(keys: Tensor, values: Tensor, key_padding: Option<Tensor>, step: usize) -> Self {
        Self {
            keys,
            values,
            key_padding,
            last_step: step,
        }
    }

    pub fn keys(&self) -> &Tensor {
        &self.keys
    }

    pub fn values(&self) -> &Tensor {
        &self.values
    }

    pub fn key_padding(&self) -> Option<&Tensor> {
        self.key_padding.as_ref()
    }

    /// Bag step at which this state was last written.
    pub fn last_step(&self) -> usize {
        self.last_step
    }

    /// Number of cached key positions.
    pub fn len(&self) -> usize {
        self.keys.dims().get(2).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
