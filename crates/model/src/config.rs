//! File-backed decoder configuration and a section-keyed config manager.

use std::{collections::HashMap, fs, path::Path};

use candle_core::DType;
use layers::{activations::ActivationKind, norm::NormKind};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::{decoder_layer::DecoderLayerOptions, error::DecoderError, norm_order::NormOrder};

/// Parameter precision of a decoder built from configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Fp32,
    Fp16,
    Bf16,
    Fp64,
}

impl Precision {
    pub fn dtype(self) -> DType {
        match self {
            Precision::Fp32 => DType::F32,
            Precision::Fp16 => DType::F16,
            Precision::Bf16 => DType::BF16,
            Precision::Fp64 => DType::F64,
        }
    }
}

/// Settings shared by every layer of a stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderLayerConfig {
    pub norm_order: NormOrder,
    pub norm_kind: NormKind,
    pub norm_eps: f64,
    /// Dropout on sub-block outputs.
    pub dropout_p: f32,
    pub scale_residual: bool,
}

impl Default for DecoderLayerConfig {
    fn default() -> Self {
        Self {
            norm_order: NormOrder::Pre,
            norm_kind: NormKind::LayerNorm,
            norm_eps: 1e-5,
            dropout_p: 0.1,
            scale_residual: false,
        }
    }
}

/// Hyper-parameters of a [`TransformerDecoder`](crate::TransformerDecoder).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    pub model_dim: usize,
    pub num_layers: usize,
    pub num_heads: usize,
    pub ffn_inner_dim: usize,
    pub activation: ActivationKind,
    /// Dropout on attention weights; `None` disables it.
    pub attn_dropout_p: Option<f32>,
    /// Give every layer an encoder-decoder attention block.
    pub encoder_decoder: bool,
    pub precision: Precision,
    /// Base seed of the dropout masks.
    pub seed: u64,
    pub layer: DecoderLayerConfig,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            model_dim: 1024,
            num_layers: 12,
            num_heads: 16,
            ffn_inner_dim: 4096,
            activation: ActivationKind::Relu,
            attn_dropout_p: None,
            encoder_decoder: false,
            precision: Precision::Fp32,
            seed: 0,
            layer: DecoderLayerConfig::default(),
        }
    }
}

impl DecoderConfig {
    /// Reads a JSON or TOML file, chosen by extension, and validates it.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DecoderError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: DecoderConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(DecoderError::config(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reports every violated constraint at once.
    pub fn validate(&self) -> Result<(), DecoderError> {
        let mut errors = Vec::new();

        if self.model_dim == 0 {
            errors.push("model_dim must be greater than 0".to_string());
        }
        if self.num_layers == 0 {
            errors.push("num_layers must be greater than 0".to_string());
        }
        if self.num_heads == 0 {
            errors.push("num_heads must be greater than 0".to_string());
        } else if self.model_dim % self.num_heads != 0 {
            errors.push(format!(
                "model_dim ({}) must be divisible by num_heads ({})",
                self.model_dim, self.num_heads
            ));
        }
        if self.ffn_inner_dim == 0 {
            errors.push("ffn_inner_dim must be greater than 0".to_string());
        }
        if let Some(p) = self.attn_dropout_p {
            if !(0.0..1.0).contains(&p) {
                errors.push("attn_dropout_p must be in [0, 1)".to_string());
            }
        }
        if !(0.0..1.0).contains(&self.layer.dropout_p) {
            errors.push("layer.dropout_p must be in [0, 1)".to_string());
        }
        if self.layer.norm_eps <= 0.0 || !self.layer.norm_eps.is_finite() {
            errors.push("layer.norm_eps must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(DecoderError::Validation(errors));
        }
        Ok(())
    }

    /// Options of the layer at `index`; each layer draws three dropout seeds.
    pub fn layer_options(&self, index: usize) -> DecoderLayerOptions {
        DecoderLayerOptions {
            scale_residual: self.layer.scale_residual,
            dropout_p: self.layer.dropout_p,
            norm_order: self.layer.norm_order,
            norm_eps: self.layer.norm_eps,
            norm_kind: self.layer.norm_kind,
            dtype: self.precision.dtype(),
            seed: self.seed.wrapping_add(3 * index as u64),
        }
    }
}

/// Named configuration sections kept as untyped values until requested.
#[derive(Debug, Clone, Default)]
pub struct ConfigManager {
    sections: HashMap<String, Value>,
}

impl ConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the top-level object of a JSON or TOML file as sections.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, DecoderError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let root: Value = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => {
                let table: toml::Table = toml::from_str(&contents)?;
                serde_json::to_value(table)?
            }
            Some(other) => {
                return Err(DecoderError::config(format!(
                    "unsupported configuration extension '{other}'"
                )));
            }
        };
        let Value::Object(map) = root else {
            return Err(DecoderError::config(format!(
                "{} must contain a table of sections",
                path.display()
            )));
        };
        let mut manager = Self::new();
        manager.update(map);
        Ok(manager)
    }

    /// Merges `sections`, replacing existing entries with the same name.
    pub fn update<I>(&mut self, sections: I)
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        self.sections.extend(sections);
    }

    pub fn insert(&mut self, path: impl Into<String>, value: Value) {
        self.sections.insert(path.into(), value);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.sections.contains_key(path)
    }

    /// Structures the section at `path` as `T`.
    pub fn get_config<T: DeserializeOwned>(&self, path: &str) -> Result<T, DecoderError> {
        let value = self
            .sections
            .get(path)
            .ok_or_else(|| DecoderError::ConfigNotFound {
                path: path.to_string(),
            })?;
        T::deserialize(value).map_err(|err| {
            DecoderError::config(format!("the '{path}' configuration cannot be parsed: {err}"))
        })
    }

    /// Like [`ConfigManager::get_config`], falling back to `default_factory`
    /// when the section is absent.
    pub fn get_config_or_else<T, F>(&self, path: &str, default_factory: F) -> Result<T, DecoderError>
    where
        T: DeserializeOwned,
        F: FnOnce() -> T,
    {
        if self.contains(path) {
            self.get_config(path)
        } else {
            Ok(default_factory())
        }
    }
}
