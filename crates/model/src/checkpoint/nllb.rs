//! Upgrade of fairseq NLLB checkpoints.

use std::path::Path;

use candle_core::{Device, Tensor};

use super::{fairseq_nllb_key_map, load_safetensors_checkpoint, StateDict};
use crate::error::DecoderError;

/// Source rows of the first four embedding rows after the upgrade.
///
/// fairseq stores the control tokens as (BOS, PAD, EOS, UNK) while the
/// SentencePiece vocabulary expects (PAD, UNK, BOS, EOS).
pub const NLLB_CONTROL_TOKEN_ORDER: [u32; 4] = [1, 3, 0, 2];

const FINAL_PROJ: &str = "final_proj.weight";
const ENCODER_EMBED: &str = "encoder_frontend.embed.weight";
const DECODER_EMBED: &str = "decoder_frontend.embed.weight";

/// Renames the keys of a fairseq NLLB state dict and fixes its embeddings.
///
/// The output projection is shared with both embedding tables, so the
/// reordered `final_proj.weight` is stored under all three names.
pub fn upgrade_nllb_checkpoint(state_dict: StateDict) -> Result<StateDict, DecoderError> {
    let mut state_dict = fairseq_nllb_key_map()?.apply(state_dict)?;

    let embeds = state_dict.get(FINAL_PROJ).ok_or_else(|| {
        DecoderError::invalid_argument(format!("checkpoint has no '{FINAL_PROJ}' tensor"))
    })?;
    let embeds = reorder_control_tokens(embeds)?;

    state_dict.insert(ENCODER_EMBED.to_string(), embeds.clone());
    state_dict.insert(DECODER_EMBED.to_string(), embeds.clone());
    state_dict.insert(FINAL_PROJ.to_string(), embeds);
    Ok(state_dict)
}

/// Loads a safetensors export of a fairseq NLLB checkpoint and upgrades it.
pub fn load_nllb_checkpoint(
    path: impl AsRef<Path>,
    device: &Device,
) -> Result<StateDict, DecoderError> {
    upgrade_nllb_checkpoint(load_safetensors_checkpoint(path, device)?)
}

fn reorder_control_tokens(embeds: &Tensor) -> Result<Tensor, DecoderError> {
    let rows = match embeds.dims() {
        [rows, _] => *rows,
        dims => {
            return Err(DecoderError::invalid_argument(format!(
                "'{FINAL_PROJ}' must be (vocab, model_dim), got {dims:?}"
            )))
        }
    };
    let control = NLLB_CONTROL_TOKEN_ORDER.len();
    if rows < control {
        return Err(DecoderError::invalid_argument(format!(
            "'{FINAL_PROJ}' has {rows} rows, need at least {control}"
        )));
    }

    let order: Vec<u32> = NLLB_CONTROL_TOKEN_ORDER
        .iter()
        .copied()
        .chain(control as u32..rows as u32)
        .collect();
    let index = Tensor::from_vec(order, rows, embeds.device())?;
    Ok(embeds.index_select(&index, 0)?)
}
