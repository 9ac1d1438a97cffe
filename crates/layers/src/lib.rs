//! Building blocks for transformer layers.
//!
//! Projections, activations, the position-wise feed-forward network,
//! normalization layers and residual helpers, all assembled from Candle
//! primitives. Inputs follow the `(batch, seq, hidden)` convention, with the
//! unbatched `(seq, hidden)` layout accepted wherever the operation is
//! position-wise. Every forward pass takes a [`PrecisionPolicy`] describing
//! storage, compute and reduction dtypes.

pub mod activations;
pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;
pub mod residual;

pub use activations::{builtin as builtin_activation, Activation, ActivationKind};
pub use dtypes::PrecisionPolicy;
pub use linear::{Linear, LinearConfig, LinearInit};
pub use mlp::{FeedForward, FeedForwardConfig, FeedForwardLayer};
pub use norm::{build_norm, LayerNorm, NormConfig, NormFactory, NormKind, NormalizationLayer, RmsNorm};
pub use residual::{DropoutMode, Residual, ResidualConfig};
