//! Transformer decoder layers with configurable normalization order.
//!
//! [`StandardDecoderLayer`] combines self-attention, optional
//! encoder-decoder attention and a feed-forward block, with the norm placed
//! according to [`NormOrder`]. [`TransformerDecoder`] stacks layers and
//! drives the incremental decoding step counter. The [`checkpoint`] module
//! imports fairseq NLLB weights.

pub mod builder;
pub mod checkpoint;
pub mod config;
pub mod decoder;
pub mod decoder_layer;
pub mod error;
pub mod norm_order;

pub use builder::build_decoder;
pub use checkpoint::{
    fairseq_nllb_key_map, load_nllb_checkpoint, load_safetensors_checkpoint,
    save_safetensors_checkpoint, upgrade_nllb_checkpoint, KeyMap, StateDict,
};
pub use config::{ConfigManager, DecoderConfig, DecoderLayerConfig, Precision};
pub use decoder::TransformerDecoder;
pub use decoder_layer::{DecoderLayerOptions, StandardDecoderLayer};
pub use error::DecoderError;
pub use norm_order::NormOrder;
