//! Residual connections, dropout, and the optional learned residual scale.
//!
//! A residual step combines a transformed `branch` with the untouched
//! `residual` input. Both share one layout (`(batch, seq, hidden)` or
//! `(seq, hidden)`) and dtype. The branch is dropped out first (training only),
//! the residual is multiplied channel-wise by the learned scale when one is
//! configured, and the two are summed in [`PrecisionPolicy::compute`].

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex,
    },
};

use candle_core::{DType, Device, Error, Result, Tensor};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration describing how a residual connection is wired.
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualConfig {
    /// Width of the model dimension; sizes the residual scale.
    pub model_dim: usize,
    /// Dropout probability applied to the transformed branch during training.
    pub dropout_p: Option<f32>,
    /// Allocate a learned per-channel scale multiplying the residual input.
    pub scale_residual: bool,
}

impl ResidualConfig {
    /// Creates a configuration with no dropout and no scaling.
    pub fn new(model_dim: usize) -> Self {
        Self {
            model_dim,
            dropout_p: None,
            scale_residual: false,
        }
    }
}

/// Dropout policy used by residual branches.
#[derive(Debug)]
pub enum DropoutMode {
    /// Dropout is disabled (probability zero).
    Disabled,
    /// Dropout is active and uses the supplied probability and RNG seed.
    Enabled { probability: f32, rng: Mutex<Lcg64> },
}

impl Clone for DropoutMode {
    fn clone(&self) -> Self {
        match self {
            DropoutMode::Disabled => DropoutMode::Disabled,
            DropoutMode::Enabled { probability, rng } => {
                // A poisoned RNG restarts from seed zero.
                let state = rng.lock().map(|g| g.clone()).unwrap_or_else(|_| Lcg64::new(0));
                DropoutMode::Enabled {
                    probability: *probability,
                    rng: Mutex::new(state),
                }
            }
        }
    }
}

impl DropoutMode {
    /// Builds a mode from an optional probability; `None` or `0.0` disables dropout.
    ///
    /// Probabilities outside `[0, 1)` are rejected.
    pub fn from_probability(probability: Option<f32>, seed: u64) -> Result<Self> {
        match probability.unwrap_or(0.0) {
            p if !(0.0..1.0).contains(&p) => Err(Error::Msg(format!(
                "dropout probability must be in [0, 1), got {p}"
            ))),
            p if p == 0.0 => Ok(DropoutMode::Disabled),
            p => Ok(DropoutMode::Enabled {
                probability: p,
                rng: Mutex::new(Lcg64::new(seed)),
            }),
        }
    }

    /// Returns the configured probability (zero when disabled).
    pub fn probability(&self) -> f32 {
        match self {
            DropoutMode::Disabled => 0.0,
            DropoutMode::Enabled { probability, .. } => *probability,
        }
    }

    /// Applies inverted dropout to `tensor`, scaling kept entries by `1 / (1 - p)`.
    pub fn apply(&self, tensor: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let (probability, rng) = match self {
            DropoutMode::Disabled => return Ok(tensor.clone()),
            DropoutMode::Enabled { probability, rng } => (*probability, rng),
        };
        let keep_prob = 1.0 - probability;
        let dims = tensor.dims().to_vec();
        let mask_data = {
            let mut rng = rng
                .lock()
                .map_err(|_| Error::Msg("dropout RNG mutex poisoned".into()))?;
            (0..tensor.elem_count())
                .map(|_| if rng.next_f32() < keep_prob { 1.0f32 } else { 0.0f32 })
                .collect::<Vec<_>>()
        };
        let dtype = policy.compute();
        checks::ensure_cast_supported("dropout.mask", DType::F32, dtype)?;
        let mask = Tensor::from_vec(mask_data, dims, tensor.device())?.to_dtype(dtype)?;
        let dropped = policy
            .cast_for_matmul(tensor)?
            .mul(&mask)?
            .affine(1.0 / keep_prob as f64, 0.0)?;
        policy.cast_to_storage(&dropped)
    }
}

/// Residual add helper with optional learned scale and dropout.
pub struct Residual {
    config: ResidualConfig,
    dropout: DropoutMode,
    scale: Option<Tensor>,
    training: AtomicBool,
}

impl Clone for Residual {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            dropout: self.dropout.clone(),
            scale: self.scale.clone(),
            training: AtomicBool::new(self.training.load(Ordering::Relaxed)),
        }
    }
}

impl fmt::Debug for Residual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Residual")
            .field("config", &self.config)
            .field("dropout", &self.dropout)
            .field("scaled", &self.scale.is_some())
            .finish()
    }
}

impl Residual {
    /// Creates a residual helper; `seed` makes dropout masks reproducible.
    ///
    /// The residual scale, when requested, starts at all ones.
    pub fn new(config: ResidualConfig, seed: u64, dtype: DType, device: &Device) -> Result<Self> {
        if config.model_dim == 0 {
            return Err(Error::Msg("residual model_dim must be non-zero".into()));
        }
        let dropout = DropoutMode::from_probability(config.dropout_p, seed)?;
        let scale = if config.scale_residual {
            Some(Tensor::ones(config.model_dim, dtype, device)?)
        } else {
            None
        };
        Ok(Self {
            config,
            dropout,
            scale,
            training: AtomicBool::new(true),
        })
    }

    /// Returns the configuration describing how the connection is wired.
    pub fn config(&self) -> &ResidualConfig {
        &self.config
    }

    /// The learned per-channel residual scale, if allocated.
    pub fn scale(&self) -> Option<&Tensor> {
        self.scale.as_ref()
    }

    /// Overwrites the residual scale (e.g. when loading parameters).
    pub fn set_scale(&mut self, value: &Tensor) -> Result<()> {
        let current = self
            .scale
            .as_ref()
            .ok_or_else(|| Error::Msg("residual has no scale parameter".into()))?;
        checks::expect_shape("residual.scale", value, &[self.config.model_dim])?;
        self.scale = Some(value.to_dtype(current.dtype())?);
        Ok(())
    }

    /// Enables or disables dropout based on training mode.
    pub fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }

    /// Whether dropout is currently applied.
    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    /// Applies dropout to `branch` when training.
    pub fn apply_dropout(&self, branch: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        if !self.is_training() {
            return Ok(branch.clone());
        }
        self.dropout.apply(branch, policy)
    }

    /// Adds `branch` to `residual`, scaling the residual channel-wise when configured.
    pub fn add(&self, branch: &Tensor, residual: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        checks::expect_last_dim("residual.input", residual, self.config.model_dim)?;
        checks::expect_shape("residual.branch", branch, residual.dims())?;
        checks::expect_same_dtype("residual.branch", branch, "residual.input", residual)?;

        let branch = policy.cast_for_matmul(branch)?;
        let mut residual = policy.cast_for_matmul(residual)?;
        if let Some(scale) = &self.scale {
            residual = residual.broadcast_mul(&policy.cast_for_matmul(scale)?)?;
        }
        policy.cast_to_storage(&branch.add(&residual)?)
    }

    /// Dropout followed by the residual add: `dropout(branch) + scale * residual`.
    pub fn step(&self, branch: &Tensor, residual: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let dropped = self.apply_dropout(branch, policy)?;
        self.add(&dropped, residual, policy)
    }
}

/// Simple 64-bit linear congruential generator for deterministic dropout masks.
#[derive(Debug, Clone)]
pub struct Lcg64 {
    state: u64,
}

impl Lcg64 {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        // Knuth's MMIX multiplier.
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn next_f32(&mut self) -> f32 {
        const SCALE: f64 = 1.0 / ((1u64 << 53) as f64);
        let bits = self.next_u64() >> 11;
        (bits as f64 * SCALE) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(dtype: DType) -> PrecisionPolicy {
        PrecisionPolicy::from_parameter_dtype(dtype)
    }

    fn residual(config: ResidualConfig, seed: u64) -> Result<Residual> {
        Residual::new(config, seed, DType::F32, &Device::Cpu)
    }

    #[test]
    fn residual_add_preserves_shape_and_dtype() -> Result<()> {
        let device = Device::Cpu;
        let dtype = DType::F16;
        let residual = Residual::new(ResidualConfig::new(8), 0, dtype, &device)?;
        let left = Tensor::randn(0f32, 1.0, (2, 4, 8), &device)?.to_dtype(dtype)?;
        let right = Tensor::randn(0f32, 1.0, (2, 4, 8), &device)?.to_dtype(dtype)?;
        let out = residual.add(&left, &right, &policy(dtype))?;
        assert_eq!(out.dims(), &[2, 4, 8]);
        assert_eq!(out.dtype(), dtype);
        Ok(())
    }

    #[test]
    fn residual_scale_multiplies_only_the_residual() -> Result<()> {
        let device = Device::Cpu;
        let mut config = ResidualConfig::new(4);
        config.scale_residual = true;
        let mut residual = residual(config, 0)?;
        assert_eq!(residual.scale().map(|s| s.dims().to_vec()), Some(vec![4]));

        residual.set_scale(&Tensor::from_vec(vec![0.0f32, 0.5, 1.0, 2.0], 4, &device)?)?;
        let branch = Tensor::full(1.0f32, (1, 1, 4), &device)?;
        let parent = Tensor::full(2.0f32, (1, 1, 4), &device)?;
        let out = residual.add(&branch, &parent, &policy(DType::F32))?;
        assert_eq!(out.flatten_all()?.to_vec1::<f32>()?, vec![1.0, 2.0, 3.0, 5.0]);
        Ok(())
    }

    #[test]
    fn set_scale_without_scale_parameter_fails() -> Result<()> {
        let mut residual = residual(ResidualConfig::new(4), 0)?;
        let value = Tensor::ones(4, DType::F32, &Device::Cpu)?;
        assert!(residual.set_scale(&value).is_err());
        Ok(())
    }

    #[test]
    fn dropout_respects_probability_and_seed() -> Result<()> {
        let device = Device::Cpu;
        let mut config = ResidualConfig::new(16);
        config.dropout_p = Some(0.25);
        let first = residual(config.clone(), 123)?;
        let second = residual(config, 123)?;
        let input = Tensor::ones((4, 8, 16), DType::F32, &device)?;

        let dropped = first.apply_dropout(&input, &policy(DType::F32))?;
        let values = dropped.flatten_all()?.to_vec1::<f32>()?;
        let mean = values.iter().copied().sum::<f32>() / values.len() as f32;
        assert!((mean - 1.0).abs() < 0.1);

        let replay = second.apply_dropout(&input, &policy(DType::F32))?;
        assert_eq!(values, replay.flatten_all()?.to_vec1::<f32>()?);
        Ok(())
    }

    #[test]
    fn dropout_disabled_in_evaluation() -> Result<()> {
        let device = Device::Cpu;
        let mut config = ResidualConfig::new(4);
        config.dropout_p = Some(0.5);
        let residual = residual(config, 0)?;
        residual.set_training(false);

        let input = Tensor::randn(0f32, 1.0, (2, 2, 4), &device)?;
        let out = residual.apply_dropout(&input, &policy(DType::F32))?;
        let diff = input.sub(&out)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 1e-7);
        Ok(())
    }

    #[test]
    fn invalid_probabilities_are_rejected() {
        for p in [-0.1f32, 1.0, 1.5] {
            let mut config = ResidualConfig::new(4);
            config.dropout_p = Some(p);
            assert!(residual(config, 0).is_err(), "p = {p}");
        }
    }
}
