//! Error types emitted by attention implementations.

use thiserror::Error;

/// Attention-specific error category.
#[derive(Debug, Error)]
pub enum AttentionError {
    /// The supplied tensor shapes do not align with the documented contract.
    #[error("invalid tensor shape: {context}")]
    InvalidShape { context: String },
    /// The kernel does not support the requested data type.
    #[error("unsupported dtype: {requested}")]
    UnsupportedDType { requested: String },
    /// A construction-time parameter is out of range.
    #[error("invalid attention configuration: {message}")]
    InvalidConfig { message: String },
    /// The incremental state bag was used outside its contract.
    #[error("incremental state error: {message}")]
    StateBag { message: String },
    /// A backend-specific failure propagated to the caller.
    #[error("{message}")]
    Backend { message: String },
}

impl AttentionError {
    pub(crate) fn shape(context: impl Into<String>) -> Self {
        Self::InvalidShape {
            context: context.into(),
        }
    }

    pub(crate) fn state(message: impl Into<String>) -> Self {
        Self::StateBag {
            message: message.into(),
        }
    }
}

impl From<candle_core::Error> for AttentionError {
    fn from(err: candle_core::Error) -> Self {
        AttentionError::Backend {
            message: err.to_string(),
        }
    }
}
