//! Activation catalogue for feed-forward networks.
//!
//! Activations are element-wise and therefore layout agnostic. Inputs are
//! promoted to [`PrecisionPolicy::compute`] before the non-linearity and the
//! result is cast back to storage.
//!
//! * **ReLU** is the default of the original Transformer and of NLLB.
//! * **GELU** uses the erf form `0.5 * x * (1 + erf(x / sqrt(2)))`.
//! * **SiLU** computes `x * sigmoid(x)` via the fused Candle kernel.

use std::sync::Arc;

use candle_core::{Result, Tensor};
use serde::{Deserialize, Serialize};

use crate::dtypes::PrecisionPolicy;

/// Identifies which non-linearity is implemented by an [`Activation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    /// Identity function, useful for wiring linear probes in tests.
    Identity,
    /// Rectified linear unit.
    #[default]
    Relu,
    /// Exact (erf based) GELU.
    Gelu,
    /// SiLU, a.k.a. swish.
    Silu,
}

/// Common interface shared by activation functions.
pub trait Activation: Send + Sync {
    /// Returns the [`ActivationKind`] for introspection.
    fn kind(&self) -> ActivationKind;

    /// Applies the activation to `input` using the precision rules in `policy`.
    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor>;
}

struct BuiltinActivation {
    kind: ActivationKind,
}

impl Activation for BuiltinActivation {
    fn kind(&self) -> ActivationKind {
        self.kind
    }

    fn forward(&self, input: &Tensor, policy: &PrecisionPolicy) -> Result<Tensor> {
        let compute = policy.cast_for_matmul(input)?;
        let activated = match self.kind {
            ActivationKind::Identity => compute,
            ActivationKind::Relu => compute.relu()?,
            ActivationKind::Gelu => compute.gelu_erf()?,
            ActivationKind::Silu => compute.silu()?,
        };
        policy.cast_to_storage(&activated)
    }
}

/// Returns a shared built-in activation implementation.
pub fn builtin(kind: ActivationKind) -> Arc<dyn Activation> {
    Arc::new(BuiltinActivation { kind })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use std::f64::consts::SQRT_2;

    #[test]
    fn relu_zeroes_negative_values() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-2.0f32, -0.5, 0.0, 1.5], (4,), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let output = builtin(ActivationKind::Relu).forward(&input, &policy)?;
        assert_eq!(output.to_vec1::<f32>()?, vec![0.0, 0.0, 0.0, 1.5]);
        Ok(())
    }

    #[test]
    fn gelu_matches_reference_formula() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::from_slice(&[-2.5f32, -0.5, 0.0, 1.0, 3.0], (5,), &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F32);
        let output = builtin(ActivationKind::Gelu).forward(&input, &policy)?;

        let scaled = input.affine(1.0 / SQRT_2, 0.0)?.erf()?;
        let inner = (Tensor::ones_like(&scaled)? + scaled)?;
        let reference = input.affine(0.5, 0.0)?.mul(&inner)?;

        let diff = output.sub(&reference)?.abs()?.max_all()?.to_vec0::<f32>()?;
        assert!(diff < 5e-6);
        Ok(())
    }

    #[test]
    fn identity_preserves_dtype_policy() -> Result<()> {
        let device = Device::Cpu;
        let input = Tensor::ones((2, 3), DType::F16, &device)?;
        let policy = PrecisionPolicy::from_parameter_dtype(DType::F16);
        let output = builtin(ActivationKind::Identity).forward(&input, &policy)?;
        assert_eq!(output.dtype(), DType::F16);
        assert_eq!(output.dims(), &[2, 3]);
        Ok(())
    }
}
