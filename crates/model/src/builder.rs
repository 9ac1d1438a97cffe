//! Assembles a [`TransformerDecoder`] from a [`DecoderConfig`].

use attention::{Attention, Config, MultiheadAttention, MultiheadAttentionConfig};
use candle_core::Device;
use layers::{
    linear::LinearInit,
    mlp::{FeedForward, FeedForwardConfig, FeedForwardLayer},
};

use crate::{
    config::DecoderConfig, decoder::TransformerDecoder, decoder_layer::StandardDecoderLayer,
    error::DecoderError,
};

/// Builds a decoder with reference attention and two-projection feed-forward
/// blocks. Attention dropout may be overridden from the environment.
pub fn build_decoder(
    config: &DecoderConfig,
    device: &Device,
) -> Result<TransformerDecoder, DecoderError> {
    config.validate()?;
    let dtype = config.precision.dtype();

    let mut attention = Config {
        dropout_p: config.attn_dropout_p,
    };
    attention.apply_env_overrides();

    let mut layers = Vec::with_capacity(config.num_layers);
    for index in 0..config.num_layers {
        let self_attn = MultiheadAttention::with_init(
            MultiheadAttentionConfig {
                attention: attention.clone(),
                ..MultiheadAttentionConfig::self_attention(config.model_dim, config.num_heads)
            },
            device,
            dtype,
        )?;
        let enc_dec_attn: Option<Box<dyn Attention>> = if config.encoder_decoder {
            Some(Box::new(MultiheadAttention::with_init(
                MultiheadAttentionConfig {
                    attention: attention.clone(),
                    ..MultiheadAttentionConfig::encoder_decoder(config.model_dim, config.num_heads)
                },
                device,
                dtype,
            )?))
        } else {
            None
        };
        let ffn: Box<dyn FeedForwardLayer> = Box::new(FeedForward::with_init(
            FeedForwardConfig::new(config.model_dim, config.ffn_inner_dim, config.activation),
            &LinearInit::XavierUniform,
            device,
            dtype,
        )?);

        layers.push(StandardDecoderLayer::new(
            Box::new(self_attn),
            enc_dec_attn,
            ffn,
            config.layer_options(index),
            device,
        )?);
    }

    TransformerDecoder::new(layers, config.layer.norm_order, config.layer.norm_eps, device)
}
