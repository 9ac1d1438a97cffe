//! Normalisation layers bundled with unified shape and dtype handling.
//!
//! Inputs are `(batch, seq, hidden)` or unbatched `(seq, hidden)`. Statistics
//! are taken along the trailing (model) axis only and the original layout is
//! preserved. Intermediate mean/variance are computed in
//! [`PrecisionPolicy::reduction`] before the result is cast back to storage.

use std::sync::Arc;

use candle_core::{DType, Device, Error, Result, Tensor, D};
use serde::{Deserialize, Serialize};

use crate::{checks, dtypes::PrecisionPolicy};

/// Available normalisation strategies for transformer blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum NormKind {
    /// Standard LayerNorm with learnable affine parameters.
    #[default]
    LayerNorm,
    /// RMSNorm variant that matches LLaMA style blocks.
    RmsNorm,
}

/// Configuration shared by all normalisation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser applied to variance or RMS computations.
    pub epsilon: f64,
    /// Desired variant of the normalisation routine.
    pub kind: NormKind,
}

impl NormConfig {
    /// Creates a configuration using defaults aligned with transformer blocks.
    pub fn new(hidden_size: usize, kind: NormKind) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
            kind,
        }
    }

    /// Overrides the variance stabiliser.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }
}

/// Shared interface for normalisation layers used inside decoder layers.
pub trait NormalizationLayer: Send + Sync {
    /// Returns the configuration so callers can check shape compatibility.
    fn config(&self) -> &NormConfig;

    /// Applies the normalisation to a hidden state tensor.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

/// Builds a normalisation module for a given model dimension and epsilon.
///
/// Decoder layers accept one of these so tests and alternative
/// implementations can substitute their own modules.
pub type NormFactory<'a> = dyn Fn(usize, f64) -> Result<Arc<dyn NormalizationLayer>> + 'a;

/// Default factory: unit scale, zero bias.
pub fn build_norm(
    kind: NormKind,
    hidden: usize,
    epsilon: f64,
    dtype: DType,
    device: &Device,
) -> Result<Arc<dyn NormalizationLayer>> {
    let config = NormConfig::new(hidden, kind).with_epsilon(epsilon);
    match kind {
        NormKind::LayerNorm => {
            let weight = Tensor::ones(hidden, dtype, device)?;
            let bias = Tensor::zeros(hidden, dtype, device)?;
            Ok(Arc::new(LayerNorm::new(weight, bias, config)?))
        }
        NormKind::RmsNorm => {
            let weight = Tensor::ones(hidden, dtype, device)?;
            Ok(Arc::new(RmsNorm::new(weight, config)?))
        }
    }
}

#[derive(Debug, Clone)]
struct NormImpl {
    config: NormConfig,
    weight: Tensor,
    bias: Option<Tensor>,
}

impl NormImpl {
    fn new(config: NormConfig, weight: Tensor, bias: Option<Tensor>) -> Result<Self> {
        if config.epsilon <= 0.0 {
            return Err(Error::Msg(format!(
                "norm epsilon must be positive, got {}",
                config.epsilon
            )));
        }
        if matches!(config.kind, NormKind::RmsNorm) && bias.is_some() {
            return Err(Error::Msg("RMSNorm does not support bias parameters".into()));
        }
        for (context, param) in [("norm.weight", Some(&weight)), ("norm.bias", bias.as_ref())] {
            if let Some(param) = param {
                checks::expect_shape(context, param, &[config.hidden_size])?;
                checks::expect_dtype_in(
                    context,
                    param,
                    &[DType::F16, DType::BF16, DType::F32, DType::F64],
                )?;
                checks::expect_contiguous(context, param)?;
            }
        }

        Ok(Self {
            config,
            weight,
            bias,
        })
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("norm.input", hidden, self.config.hidden_size)?;

        let hidden_size = self.config.hidden_size as f64;
        let mut compute = policy.cast_for_reduction(hidden)?;

        if matches!(self.config.kind, NormKind::LayerNorm) {
            let mean = (compute.sum_keepdim(D::Minus1)? / hidden_size)?;
            compute = compute.broadcast_sub(&mean)?;
        }

        let variance = (compute.sqr()?.sum_keepdim(D::Minus1)? / hidden_size)?;
        let denom = (variance + self.config.epsilon)?.sqrt()?;
        let mut normalized = compute.broadcast_div(&denom)?;

        if normalized.dtype() != policy.compute() {
            normalized = normalized.to_dtype(policy.compute())?;
        }
        normalized = normalized.broadcast_mul(&self.weight.to_dtype(normalized.dtype())?)?;
        if let Some(bias) = &self.bias {
            normalized = normalized.broadcast_add(&bias.to_dtype(normalized.dtype())?)?;
        }

        policy.cast_to_storage(&normalized)
    }
}

/// Standard LayerNorm with learnable scale and bias.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    inner: NormImpl,
}

impl LayerNorm {
    /// Constructs a LayerNorm with learnable scale and bias parameters.
    pub fn new(weight: Tensor, bias: Tensor, mut config: NormConfig) -> Result<Self> {
        config.kind = NormKind::LayerNorm;
        Ok(Self {
            inner: NormImpl::new(config, weight, Some(bias))?,
        })
    }
}

impl NormalizationLayer for LayerNorm {
    fn config(&self) -> &NormConfig {
        &self.inner.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.inner.forward(hidden, policy)
    }
}

/// Root mean square norm that mirrors LLaMA-style transformer blocks.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    inner: NormImpl,
}

impl RmsNorm {
    /// Constructs a RMSNorm with learnable scale.
    pub fn new(weight: Tensor, mut config: NormConfig) -> Result<Self> {
        config.kind = NormKind::RmsNorm;
        Ok(Self {
            inner: NormImpl::new(config, weight, None)?,
        })
    }
}

impl NormalizationLayer for RmsNorm {
    fn config(&self) -> &NormConfig {
        &self.inner.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        self.inner.forward(hidden, policy)
    }
}
