//! A stack of decoder layers with an optional final layer norm.

use std::sync::Arc;

use attention::{masks::build_causal_mask, IncrementalStateBag};
use candle_core::{Device, Tensor};
use layers::{
    dtypes::PrecisionPolicy,
    norm::{build_norm, NormalizationLayer},
};

use crate::{decoder_layer::StandardDecoderLayer, error::DecoderError, norm_order::NormOrder};

/// Applies its layers in order. Pre-norm stacks end with a layer norm since
/// their last residual addition is otherwise unnormalized.
pub struct TransformerDecoder {
    model_dim: usize,
    norm_order: NormOrder,
    layers: Vec<StandardDecoderLayer>,
    layer_norm: Option<Arc<dyn NormalizationLayer>>,
    policy: PrecisionPolicy,
}

impl std::fmt::Debug for TransformerDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerDecoder")
            .field("model_dim", &self.model_dim)
            .field("norm_order", &self.norm_order)
            .field("num_layers", &self.layers.len())
            .field("final_norm", &self.layer_norm.is_some())
            .finish()
    }
}

impl TransformerDecoder {
    /// Builds the stack; the final norm reuses the first layer's norm kind and
    /// dtype. Every layer must use `norm_order`.
    pub fn new(
        layers: Vec<StandardDecoderLayer>,
        norm_order: NormOrder,
        norm_eps: f64,
        device: &Device,
    ) -> Result<Self, DecoderError> {
        let first = layers
            .first()
            .ok_or_else(|| DecoderError::config("decoder needs at least one layer"))?;
        let model_dim = first.model_dim();
        if let Some((index, layer)) = layers
            .iter()
            .enumerate()
            .find(|(_, layer)| layer.model_dim() != model_dim)
        {
            return Err(DecoderError::config(format!(
                "layer {index} has model_dim {}, expected {model_dim}",
                layer.model_dim()
            )));
        }
        if let Some((index, layer)) = layers
            .iter()
            .enumerate()
            .find(|(_, layer)| layer.norm_order() != norm_order)
        {
            return Err(DecoderError::config(format!(
                "layer {index} uses norm order {}, but the stack is {norm_order}",
                layer.norm_order()
            )));
        }
        if norm_eps <= 0.0 {
            return Err(DecoderError::config(format!(
                "norm_eps must be positive, got {norm_eps}"
            )));
        }

        let options = first.options().clone();
        let layer_norm = if norm_order.is_pre() {
            Some(build_norm(options.norm_kind, model_dim, norm_eps, options.dtype, device)?)
        } else {
            None
        };

        log::info!(
            "decoder init layers={} model_dim={} norm_order={} final_norm={} dtype={:?}",
            layers.len(),
            model_dim,
            norm_order,
            layer_norm.is_some(),
            options.dtype
        );

        Ok(Self {
            model_dim,
            norm_order,
            layers,
            layer_norm,
            policy: PrecisionPolicy::from_parameter_dtype(options.dtype),
        })
    }

    pub fn model_dim(&self) -> usize {
        self.model_dim
    }

    pub fn norm_order(&self) -> NormOrder {
        self.norm_order
    }

    pub fn layers(&self) -> &[StandardDecoderLayer] {
        &self.layers
    }

    pub fn layers_mut(&mut self) -> &mut [StandardDecoderLayer] {
        &mut self.layers
    }

    pub fn has_final_norm(&self) -> bool {
        self.layer_norm.is_some()
    }

    pub fn set_training(&self, training: bool) {
        for layer in &self.layers {
            layer.set_training(training);
        }
    }

    /// Runs every layer, then the final norm.
    ///
    /// Arguments follow [`StandardDecoderLayer::forward`]. When a bag is
    /// supplied its step is advanced by the number of positions in `x` once
    /// all layers have run; on error it is restored to its state before the
    /// call.
    pub fn forward(
        &self,
        x: &Tensor,
        padding_mask: Option<&Tensor>,
        self_attn_mask: Option<&Tensor>,
        enc_out: Option<&Tensor>,
        enc_padding_mask: Option<&Tensor>,
        state_bag: Option<&mut IncrementalStateBag>,
    ) -> Result<Tensor, DecoderError> {
        let positions = sequence_len(x)?;
        let mut state_bag = state_bag;
        let snapshot = state_bag.as_deref().map(IncrementalStateBag::snapshot);

        let result = self.forward_layers(
            x,
            padding_mask,
            self_attn_mask,
            enc_out,
            enc_padding_mask,
            state_bag.as_deref_mut(),
        );
        let result = match (result, state_bag.as_deref_mut()) {
            (Ok(hidden), Some(bag)) => bag
                .increment_step(positions)
                .map(|()| hidden)
                .map_err(DecoderError::from),
            (result, _) => result,
        };
        if result.is_err() {
            if let (Some(bag), Some(snapshot)) = (state_bag, snapshot) {
                bag.restore(snapshot);
            }
        }
        result
    }

    fn forward_layers(
        &self,
        x: &Tensor,
        padding_mask: Option<&Tensor>,
        self_attn_mask: Option<&Tensor>,
        enc_out: Option<&Tensor>,
        enc_padding_mask: Option<&Tensor>,
        mut state_bag: Option<&mut IncrementalStateBag>,
    ) -> Result<Tensor, DecoderError> {
        let mut hidden = x.clone();
        for layer in &self.layers {
            hidden = layer.forward(
                &hidden,
                padding_mask,
                self_attn_mask,
                enc_out,
                enc_padding_mask,
                state_bag.as_deref_mut(),
            )?;
        }
        if let Some(norm) = &self.layer_norm {
            hidden = norm.forward(&hidden, &self.policy)?;
        }
        Ok(hidden)
    }

    /// [`TransformerDecoder::forward`] with a causal self-attention mask
    /// covering the positions already cached in `state_bag`.
    pub fn forward_causal(
        &self,
        x: &Tensor,
        padding_mask: Option<&Tensor>,
        enc_out: Option<&Tensor>,
        enc_padding_mask: Option<&Tensor>,
        state_bag: Option<&mut IncrementalStateBag>,
    ) -> Result<Tensor, DecoderError> {
        let q_len = sequence_len(x)?;
        let cached = state_bag.as_ref().map_or(0, |bag| bag.step());
        let mask = build_causal_mask(x.device(), q_len, cached + q_len)?;
        self.forward(x, padding_mask, Some(&mask), enc_out, enc_padding_mask, state_bag)
    }
}

fn sequence_len(x: &Tensor) -> Result<usize, DecoderError> {
    match x.dims() {
        [seq, _] | [_, seq, _] => Ok(*seq),
        dims => Err(DecoderError::invalid_argument(format!(
            "x must be (batch, seq, model_dim) or (seq, model_dim), got {dims:?}"
        ))),
    }
}
