//! Portable, exact implementations of multi-head attention.
//!
//! These paths favour clarity over absolute performance and serve as the
//! baseline for validating the decoder layer.

pub mod multihead;

pub use multihead::{MultiheadAttention, MultiheadAttentionConfig};
