//! Position-wise feed-forward blocks built on top of projections and activations.
//!
//! The network maps `(..., hidden)` to `(..., intermediate)` with
//! `inner_proj`, applies the activation, then contracts back to `hidden` with
//! `output_proj`. It holds no state across generation steps and never sees
//! attention masks.

use std::{fmt, sync::Arc};

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{
    activations::{builtin, Activation, ActivationKind},
    checks,
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
};

/// Configuration shared by transformer feed-forward networks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForwardConfig {
    /// Model hidden size; input and output width of the network.
    pub hidden_size: usize,
    /// Width of the activation space.
    pub intermediate_size: usize,
    /// Activation applied between projections.
    pub activation: ActivationKind,
    /// Whether both projections carry a bias.
    pub bias: bool,
}

impl FeedForwardConfig {
    /// Creates a standard two-projection MLP configuration.
    pub fn new(hidden_size: usize, intermediate_size: usize, activation: ActivationKind) -> Self {
        Self {
            hidden_size,
            intermediate_size,
            activation,
            bias: true,
        }
    }

    /// Derives the intermediate width from a multiple of the hidden size.
    pub fn with_expansion_ratio(hidden_size: usize, ratio: f32, activation: ActivationKind) -> Self {
        let intermediate = ((hidden_size as f32) * ratio).round().max(1.0) as usize;
        Self::new(hidden_size, intermediate, activation)
    }
}

/// Shared interface for feed-forward stacks.
///
/// Implementations must be shape preserving: the output has exactly the
/// shape of `hidden`.
pub trait FeedForwardLayer: Send + Sync {
    /// Configuration metadata used during layer assembly.
    fn config(&self) -> &FeedForwardConfig;

    /// Performs the forward pass through the MLP.
    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;

    /// Switches between training and evaluation behaviour.
    fn set_training(&self, _training: bool) {}
}

/// Two-projection feed-forward network.
#[derive(Clone)]
pub struct FeedForward {
    config: FeedForwardConfig,
    inner_proj: Linear,
    activation: Arc<dyn Activation>,
    output_proj: Linear,
}

impl fmt::Debug for FeedForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedForward")
            .field("config", &self.config)
            .finish()
    }
}

impl FeedForward {
    /// Assembles the network from existing projections.
    pub fn new(config: FeedForwardConfig, inner_proj: Linear, output_proj: Linear) -> Result<Self> {
        let inner = inner_proj.config();
        let output = output_proj.config();
        if inner.input_dim != config.hidden_size || inner.output_dim != config.intermediate_size {
            return Err(Error::Msg(format!(
                "ffn.inner_proj must map {} -> {}, got {} -> {}",
                config.hidden_size, config.intermediate_size, inner.input_dim, inner.output_dim
            )));
        }
        if output.input_dim != config.intermediate_size || output.output_dim != config.hidden_size
        {
            return Err(Error::Msg(format!(
                "ffn.output_proj must map {} -> {}, got {} -> {}",
                config.intermediate_size, config.hidden_size, output.input_dim, output.output_dim
            )));
        }
        let activation = builtin(config.activation);
        Ok(Self {
            config,
            inner_proj,
            activation,
            output_proj,
        })
    }

    /// Builds the network with freshly initialised projections.
    pub fn with_init(
        config: FeedForwardConfig,
        init: &LinearInit,
        device: &Device,
        dtype: DType,
    ) -> Result<Self> {
        if config.hidden_size == 0 || config.intermediate_size == 0 {
            return Err(Error::Msg(
                "ffn hidden and intermediate sizes must be non-zero".into(),
            ));
        }
        let mut inner_cfg = LinearConfig::new(config.hidden_size, config.intermediate_size);
        inner_cfg.bias = config.bias;
        let mut output_cfg = LinearConfig::new(config.intermediate_size, config.hidden_size);
        output_cfg.bias = config.bias;

        let inner_proj = Linear::with_init(inner_cfg, init, device, dtype)?;
        let output_proj = Linear::with_init(output_cfg, init, device, dtype)?;
        Self::new(config, inner_proj, output_proj)
    }

    /// Expansion projection.
    pub fn inner_proj(&self) -> &Linear {
        &self.inner_proj
    }

    /// Contraction projection.
    pub fn output_proj(&self) -> &Linear {
        &self.output_proj
    }
}

impl FeedForwardLayer for FeedForward {
    fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("ffn.input", hidden, self.config.hidden_size)?;
        let expanded = self.inner_proj.forward(hidden, policy)?;
        let activated = self.activation.forward(&expanded, policy)?;
        self.output_proj.forward(&activated, policy)
    }
}
