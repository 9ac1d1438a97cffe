//! Placement of layer normalization relative to the residual connection.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Where a decoder layer normalizes each sub-block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormOrder {
    /// Normalize after the residual addition, as in the original Transformer.
    #[default]
    Post,
    /// Normalize the sub-block input; the residual stays unnormalized.
    Pre,
    /// [`NormOrder::Pre`] plus an extra norm on the self-attention output
    /// (NormFormer).
    PreWithNormformer,
}

impl NormOrder {
    /// Whether sub-block inputs are normalized.
    pub fn is_pre(self) -> bool {
        !matches!(self, NormOrder::Post)
    }

    /// Whether the self-attention output gets its own norm.
    pub fn uses_normformer(self) -> bool {
        matches!(self, NormOrder::PreWithNormformer)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NormOrder::Post => "post",
            NormOrder::Pre => "pre",
            NormOrder::PreWithNormformer => "pre_with_normformer",
        }
    }
}

impl fmt::Display for NormOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
