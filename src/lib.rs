//! Transformer decoder layers with configurable normalization order,
//! optional encoder-decoder attention and incremental decoding.
//!
//! The workspace is split into `layers` (projections, norms, feed-forward,
//! residual), `attention` (multi-head attention, masks, incremental state)
//! and `model` (decoder layers, stacks, configuration, checkpoint import).

pub use attention;
pub use layers;
pub use model;

pub use attention::{IncrementalStateBag, MultiheadAttention, MultiheadAttentionConfig};
pub use model::{
    build_decoder, ConfigManager, DecoderConfig, DecoderError, DecoderLayerOptions, NormOrder,
    StandardDecoderLayer, TransformerDecoder,
};

use anyhow::Result;
use candle_core::Device;

/// Picks the first usable accelerator, falling back to the CPU.
///
/// `SEQFORMER_FORCE_CPU` skips detection.
pub fn setup_device() -> Result<Device> {
    if std::env::var("SEQFORMER_FORCE_CPU").is_ok() {
        log::info!("SEQFORMER_FORCE_CPU set, using CPU backend");
        return Ok(Device::Cpu);
    }
    #[cfg(feature = "metal")]
    {
        match Device::new_metal(0) {
            Ok(device) if metal_preflight(&device).is_ok() => {
                log::info!("metal device selected: {device:?}");
                return Ok(device);
            }
            Ok(_) => log::warn!("metal device failed preflight, falling back"),
            Err(err) => log::debug!("metal unavailable: {err}"),
        }
    }

    match Device::cuda_if_available(0) {
        Ok(device) if device.is_cuda() => {
            log::info!("cuda device selected: {device:?}");
            Ok(device)
        }
        Ok(_) | Err(_) => {
            log::info!("using CPU backend");
            Ok(Device::Cpu)
        }
    }
}

/// Runs a matmul and a softmax-sized reduction on `device`.
#[cfg(feature = "metal")]
fn metal_preflight(device: &Device) -> Result<()> {
    use candle_core::{DType, Tensor};

    let a = Tensor::ones((2, 4), DType::F32, device)?;
    let b = Tensor::ones((4, 2), DType::F32, device)?;
    let _ = a.matmul(&b)?;

    let x = Tensor::randn(0.0f32, 1.0, (4, 16, 32), device)?;
    let _ = x.matmul(&x.transpose(1, 2)?)?.max_keepdim(2)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn facade_builds_a_decoder_on_the_selected_device() -> Result<()> {
        let device = setup_device()?;
        let config = DecoderConfig {
            model_dim: 8,
            num_layers: 1,
            num_heads: 2,
            ffn_inner_dim: 16,
            ..Default::default()
        };
        let decoder = build_decoder(&config, &device)?;
        assert_eq!(decoder.model_dim(), 8);
        Ok(())
    }
}
