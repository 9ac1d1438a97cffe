//! Errors raised while building or running decoder layers.

use attention::AttentionError;
use thiserror::Error;

/// Failure category for the decoder crate.
#[derive(Debug, Error)]
pub enum DecoderError {
    /// Construction-time configuration problem (dimension mismatch, bad
    /// hyper-parameters, empty stack).
    #[error("invalid configuration: {message}")]
    Config { message: String },
    /// Every violation found while validating a configuration file.
    #[error("invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
    /// A call-time contract violation.
    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },
    /// A requested configuration section does not exist.
    #[error("the '{path}' configuration is not found")]
    ConfigNotFound { path: String },
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Tensor(#[from] candle_core::Error),
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}

impl DecoderError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }
}
