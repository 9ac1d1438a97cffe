//! Regex based renaming of checkpoint parameter names.

use regex::Regex;

use super::StateDict;
use crate::error::DecoderError;

/// Renames from fairseq NLLB checkpoints to this crate's module layout.
///
/// Order matters: the `encoder_attn.out_proj` rule must precede the general
/// `encoder_attn` rule.
#[rustfmt::skip]
pub const FAIRSEQ_NLLB_KEY_MAP: &[(&str, &str)] = &[
    (r"^decoder\.layers\.([0-9]+)\.self_attn\.out_proj\.", "decoder.layers.${1}.self_attn.output_proj."),
    (r"^encoder\.layers\.([0-9]+)\.self_attn\.out_proj\.", "encoder.layers.${1}.self_attn.output_proj."),
    (r"^decoder\.layers\.([0-9]+)\.encoder_attn\.out_proj\.", "decoder.layers.${1}.encoder_decoder_attn.output_proj."),
    (r"^decoder\.layers\.([0-9]+)\.encoder_attn\.", "decoder.layers.${1}.encoder_decoder_attn."),
    (r"^decoder\.layers\.([0-9]+)\.encoder_attn_layer_norm\.", "decoder.layers.${1}.encoder_decoder_attn_layer_norm."),
    (r"^encoder\.layers\.([0-9]+)\.fc1\.", "encoder.layers.${1}.ffn.inner_proj."),
    (r"^decoder\.layers\.([0-9]+)\.fc1\.", "decoder.layers.${1}.ffn.inner_proj."),
    (r"^encoder\.layers\.([0-9]+)\.fc2\.", "encoder.layers.${1}.ffn.output_proj."),
    (r"^decoder\.layers\.([0-9]+)\.fc2\.", "decoder.layers.${1}.ffn.output_proj."),
    (r"^encoder\.layers\.([0-9]+)\.final_layer_norm\.", "encoder.layers.${1}.ffn_layer_norm."),
    (r"^decoder\.layers\.([0-9]+)\.final_layer_norm\.", "decoder.layers.${1}.ffn_layer_norm."),
    (r"^encoder\.embed_tokens\.", "encoder_frontend.embed."),
    (r"^decoder\.embed_tokens\.", "decoder_frontend.embed."),
    (r"^decoder\.output_projection\.", "final_proj."),
];

/// Ordered `(pattern, replacement)` rules. Each key is rewritten by the first
/// rule whose pattern matches it; keys no rule matches are kept as is.
#[derive(Debug, Clone)]
pub struct KeyMap {
    rules: Vec<(Regex, String)>,
}

impl KeyMap {
    /// Compiles `rules`; replacements may reference groups as `${n}`.
    pub fn new<P, R>(rules: impl IntoIterator<Item = (P, R)>) -> Result<Self, DecoderError>
    where
        P: AsRef<str>,
        R: Into<String>,
    {
        let rules = rules
            .into_iter()
            .map(|(pattern, replacement)| {
                let pattern = pattern.as_ref();
                Regex::new(pattern)
                    .map(|regex| (regex, replacement.into()))
                    .map_err(|err| {
                        DecoderError::config(format!("invalid key pattern '{pattern}': {err}"))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// New name of `key`, or `None` when no rule matches.
    pub fn rename(&self, key: &str) -> Option<String> {
        self.rules
            .iter()
            .find(|(pattern, _)| pattern.is_match(key))
            .map(|(pattern, replacement)| pattern.replace(key, replacement.as_str()).into_owned())
    }

    /// Renames every key of `state_dict`.
    ///
    /// Two keys ending up under the same name is an error, since one tensor
    /// would silently replace the other.
    pub fn apply(&self, state_dict: StateDict) -> Result<StateDict, DecoderError> {
        let mut renamed = StateDict::with_capacity(state_dict.len());
        let mut hits = 0usize;
        for (key, tensor) in state_dict {
            let new_key = match self.rename(&key) {
                Some(new_key) => {
                    hits += 1;
                    new_key
                }
                None => key.clone(),
            };
            if renamed.insert(new_key.clone(), tensor).is_some() {
                return Err(DecoderError::invalid_argument(format!(
                    "key '{key}' maps to '{new_key}', which is already present"
                )));
            }
        }
        log::debug!("renamed {hits} of {} checkpoint keys", renamed.len());
        Ok(renamed)
    }
}

/// [`FAIRSEQ_NLLB_KEY_MAP`] compiled.
pub fn fairseq_nllb_key_map() -> Result<KeyMap, DecoderError> {
    KeyMap::new(FAIRSEQ_NLLB_KEY_MAP.iter().copied())
}
