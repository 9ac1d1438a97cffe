//! Configuration options shared by all attention implementations.
//!
//! The [`Config`] struct captures run-time knobs such as dropout that callers
//! can tune without swapping implementations. Deployment overrides are read
//! from the environment by [`Config::apply_env_overrides`].

use serde::{Deserialize, Serialize};

use super::AttentionError;

/// Environment variable overriding [`Config::dropout_p`].
pub const DROPOUT_ENV: &str = "SEQFORMER_ATTN_DROPOUT";

/// Configuration driving attention behaviour.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Probability for dropout applied to attention weights during training.
    ///
    /// When `None`, dropout is disabled and the computation is deterministic.
    #[serde(default)]
    pub dropout_p: Option<f32>,
}

impl Config {
    /// Overwrites fields from `SEQFORMER_ATTN_*` variables when set.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Same as [`Config::apply_env_overrides`] with an injectable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let Some(raw) = lookup(DROPOUT_ENV) else {
            return;
        };
        match raw.trim() {
            "" | "none" | "off" => self.dropout_p = None,
            value => match value.parse::<f32>() {
                Ok(p) => self.dropout_p = Some(p),
                Err(err) => log::warn!("ignoring {DROPOUT_ENV}={raw:?}: {err}"),
            },
        }
    }

    /// Checks the dropout probability lies in `[0, 1)`.
    pub fn validate(&self) -> Result<(), AttentionError> {
        match self.dropout_p {
            Some(p) if !(0.0..1.0).contains(&p) => Err(AttentionError::InvalidConfig {
                message: format!("attention dropout probability must be in [0, 1), got {p}"),
            }),
            _ => Ok(()),
        }
    }

    /// Effective dropout probability, zero when disabled.
    pub fn effective_dropout(&self) -> f32 {
        self.dropout_p.unwrap_or(0.0)
    }
}
