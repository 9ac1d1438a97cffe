//! Multi-head attention with incremental decoding support.
//!
//! The crate defines the [`Attention`] trait consumed by decoder layers, the
//! caller-owned [`IncrementalStateBag`] that carries cached keys and values
//! between decoding steps, mask builders, and a portable reference
//! [`MultiheadAttention`] implementation.
//!
//! Inputs use the `(batch, seq, model_dim)` layout. Queries and keys may have
//! different lengths (encoder-decoder attention); the output always mirrors
//! the query. Masks are either boolean (`u8`, non-zero = forbidden) or
//! additive floats. Dropout on attention weights is a train-only concern
//! controlled by [`Config::dropout_p`].

pub mod core;
pub mod kv_cache;
pub mod masks;
pub mod reference;

pub use core::{Attention, AttentionError, Config};
pub use kv_cache::{AttentionState, BagSnapshot, CacheMode, IncrementalStateBag, ModuleId};
pub use reference::{MultiheadAttention, MultiheadAttentionConfig};
