//! Checkpoint import: safetensors I/O, parameter key remapping and the NLLB
//! upgrade.

mod key_map;
mod nllb;

use std::{collections::HashMap, path::Path};

use candle_core::{Device, Tensor};

use crate::error::DecoderError;

pub use key_map::{fairseq_nllb_key_map, KeyMap, FAIRSEQ_NLLB_KEY_MAP};
pub use nllb::{load_nllb_checkpoint, upgrade_nllb_checkpoint, NLLB_CONTROL_TOKEN_ORDER};

/// Parameter name to tensor.
pub type StateDict = HashMap<String, Tensor>;

/// Reads every tensor of a safetensors file onto `device`.
pub fn load_safetensors_checkpoint(
    path: impl AsRef<Path>,
    device: &Device,
) -> Result<StateDict, DecoderError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(DecoderError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("checkpoint {} does not exist", path.display()),
        )));
    }
    let state_dict = candle_core::safetensors::load(path, device)?;
    log::info!(
        "loaded {} tensors from {}",
        state_dict.len(),
        path.display()
    );
    Ok(state_dict)
}

/// Writes `state_dict` as a safetensors file.
pub fn save_safetensors_checkpoint(
    state_dict: &StateDict,
    path: impl AsRef<Path>,
) -> Result<(), DecoderError> {
    let path = path.as_ref();
    if state_dict.is_empty() {
        return Err(DecoderError::invalid_argument(
            "state dict contains no tensors to save",
        ));
    }
    candle_core::safetensors::save(state_dict, path)?;
    log::debug!("saved {} tensors to {}", state_dict.len(), path.display());
    Ok(())
}
