//! The standard Transformer decoder layer.
//!
//! A layer runs three sub-blocks in sequence: self-attention, optional
//! encoder-decoder attention, and the feed-forward network. Each sub-block
//! follows the same residual recipe, parameterised by [`NormOrder`]:
//!
//! ```text
//! residual = x
//! x = norm(x)                       if pre-norm
//! x = sub_block(x)
//! x = self_attn_norm(x)             self-attention under NormFormer only
//! x = dropout(x)                    training only
//! residual = residual * scale       feed-forward only, when scale_residual
//! x = x + residual
//! x = norm(x)                       if post-norm
//! ```
//!
//! Inputs are `(batch, seq, model_dim)` or unbatched `(seq, model_dim)`; the
//! output has exactly the shape of the input. The layer owns no session
//! state: incremental decoding caches live in the caller's
//! [`IncrementalStateBag`], which is threaded through to the attention
//! modules untouched.

use std::{fmt, sync::Arc};

use attention::{Attention, IncrementalStateBag};
use candle_core::{DType, Device, Tensor};
use layers::{
    dtypes::PrecisionPolicy,
    mlp::FeedForwardLayer,
    norm::{build_norm, NormFactory, NormKind, NormalizationLayer},
    residual::{Residual, ResidualConfig},
};

use crate::{error::DecoderError, norm_order::NormOrder};

/// Construction options of a [`StandardDecoderLayer`].
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderLayerOptions {
    /// Learn a per-channel scale on the feed-forward residual (NormFormer).
    pub scale_residual: bool,
    /// Dropout on every sub-block output before the residual addition.
    pub dropout_p: f32,
    pub norm_order: NormOrder,
    pub norm_eps: f64,
    pub norm_kind: NormKind,
    /// Parameter dtype of the norms and the residual scale.
    pub dtype: DType,
    /// Seed of the dropout masks.
    pub seed: u64,
}

impl Default for DecoderLayerOptions {
    fn default() -> Self {
        Self {
            scale_residual: false,
            dropout_p: 0.1,
            norm_order: NormOrder::Post,
            norm_eps: 1e-5,
            norm_kind: NormKind::LayerNorm,
            dtype: DType::F32,
            seed: 0,
        }
    }
}

impl DecoderLayerOptions {
    fn validate(&self) -> Result<(), DecoderError> {
        if !(0.0..1.0).contains(&self.dropout_p) {
            return Err(DecoderError::config(format!(
                "dropout_p must be in [0, 1), got {}",
                self.dropout_p
            )));
        }
        if self.norm_eps <= 0.0 || !self.norm_eps.is_finite() {
            return Err(DecoderError::config(format!(
                "norm_eps must be positive, got {}",
                self.norm_eps
            )));
        }
        Ok(())
    }
}

/// Cross-attention slot: present or absent as a whole.
struct EncoderDecoderAttention {
    attn: Box<dyn Attention>,
    layer_norm: Arc<dyn NormalizationLayer>,
    residual: Residual,
}

/// Decoder layer with configurable norm placement, optional cross-attention
/// and an optional residual scale on the feed-forward block.
pub struct StandardDecoderLayer {
    model_dim: usize,
    options: DecoderLayerOptions,
    policy: PrecisionPolicy,
    self_attn: Box<dyn Attention>,
    self_attn_layer_norm: Arc<dyn NormalizationLayer>,
    self_attn_norm: Option<Arc<dyn NormalizationLayer>>,
    self_attn_residual: Residual,
    enc_dec_attn: Option<EncoderDecoderAttention>,
    ffn: Box<dyn FeedForwardLayer>,
    ffn_layer_norm: Arc<dyn NormalizationLayer>,
    ffn_residual: Residual,
}

impl fmt::Debug for StandardDecoderLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StandardDecoderLayer")
            .field("model_dim", &self.model_dim)
            .field("norm_order", &self.options.norm_order)
            .field("dropout_p", &self.options.dropout_p)
            .field("scale_residual", &self.options.scale_residual)
            .field("enc_dec_attn", &self.enc_dec_attn.is_some())
            .finish()
    }
}

impl StandardDecoderLayer {
    /// Builds a layer whose norms come from [`build_norm`] with the kind,
    /// epsilon and dtype in `options`.
    pub fn new(
        self_attn: Box<dyn Attention>,
        enc_dec_attn: Option<Box<dyn Attention>>,
        ffn: Box<dyn FeedForwardLayer>,
        options: DecoderLayerOptions,
        device: &Device,
    ) -> Result<Self, DecoderError> {
        let (kind, dtype) = (options.norm_kind, options.dtype);
        let factory = |dim: usize, eps: f64| build_norm(kind, dim, eps, dtype, device);
        Self::with_norm_factory(self_attn, enc_dec_attn, ffn, options, device, &factory)
    }

    /// Builds a layer with norms produced by `norm_factory`.
    ///
    /// The factory is called once per norm, in this order: self-attention
    /// layer norm, NormFormer self-attention norm, encoder-decoder attention
    /// layer norm, feed-forward layer norm. Absent norms are skipped.
    pub fn with_norm_factory(
        self_attn: Box<dyn Attention>,
        enc_dec_attn: Option<Box<dyn Attention>>,
        ffn: Box<dyn FeedForwardLayer>,
        options: DecoderLayerOptions,
        device: &Device,
        norm_factory: &NormFactory<'_>,
    ) -> Result<Self, DecoderError> {
        options.validate()?;

        let model_dim = self_attn.model_dim();
        if model_dim == 0 {
            return Err(DecoderError::config("model_dim must be greater than zero"));
        }
        if let Some(attn) = &enc_dec_attn {
            if attn.model_dim() != model_dim {
                return Err(DecoderError::config(format!(
                    "model_dim of enc_dec_attn ({}) does not match model_dim of self_attn ({model_dim})",
                    attn.model_dim()
                )));
            }
        }
        let ffn_dim = ffn.config().hidden_size;
        if ffn_dim != model_dim {
            return Err(DecoderError::config(format!(
                "model_dim of ffn ({ffn_dim}) does not match model_dim of self_attn ({model_dim})"
            )));
        }

        let make_norm = |name: &str| -> Result<Arc<dyn NormalizationLayer>, DecoderError> {
            let norm = norm_factory(model_dim, options.norm_eps)?;
            let hidden = norm.config().hidden_size;
            if hidden != model_dim {
                return Err(DecoderError::config(format!(
                    "{name} normalizes {hidden} features, expected {model_dim}"
                )));
            }
            Ok(norm)
        };
        let make_residual = |offset: u64, scaled: bool| -> Result<Residual, DecoderError> {
            let config = ResidualConfig {
                model_dim,
                dropout_p: Some(options.dropout_p),
                scale_residual: scaled,
            };
            Ok(Residual::new(
                config,
                options.seed.wrapping_add(offset),
                options.dtype,
                device,
            )?)
        };

        let self_attn_layer_norm = make_norm("self_attn_layer_norm")?;
        let self_attn_norm = if options.norm_order.uses_normformer() {
            Some(make_norm("self_attn_norm")?)
        } else {
            None
        };
        let enc_dec_attn = match enc_dec_attn {
            Some(attn) => Some(EncoderDecoderAttention {
                attn,
                layer_norm: make_norm("enc_dec_attn_layer_norm")?,
                residual: make_residual(1, false)?,
            }),
            None => None,
        };
        let ffn_layer_norm = make_norm("ffn_layer_norm")?;
        let self_attn_residual = make_residual(0, false)?;
        let ffn_residual = make_residual(2, options.scale_residual)?;
        let policy = PrecisionPolicy::from_parameter_dtype(options.dtype);

        Ok(Self {
            model_dim,
            options,
            policy,
            self_attn,
            self_attn_layer_norm,
            self_attn_norm,
            self_attn_residual,
            enc_dec_attn,
            ffn,
            ffn_layer_norm,
            ffn_residual,
        })
    }

    pub fn model_dim(&self) -> usize {
        self.model_dim
    }

    pub fn norm_order(&self) -> NormOrder {
        self.options.norm_order
    }

    pub fn options(&self) -> &DecoderLayerOptions {
        &self.options
    }

    /// Whether the layer was built with encoder-decoder attention.
    pub fn has_enc_dec_attn(&self) -> bool {
        self.enc_dec_attn.is_some()
    }

    /// Per-channel scale on the feed-forward residual, if allocated.
    pub fn residual_scale(&self) -> Option<&Tensor> {
        self.ffn_residual.scale()
    }

    /// Overwrites the residual scale, e.g. when loading a checkpoint.
    pub fn set_residual_scale(&mut self, scale: &Tensor) -> Result<(), DecoderError> {
        if self.ffn_residual.scale().is_none() {
            return Err(DecoderError::invalid_argument(
                "layer was built without scale_residual",
            ));
        }
        Ok(self.ffn_residual.set_scale(scale)?)
    }

    /// Toggles dropout in the layer and every sub-module.
    pub fn set_training(&self, training: bool) {
        self.self_attn.set_training(training);
        self.self_attn_residual.set_training(training);
        if let Some(slot) = &self.enc_dec_attn {
            slot.attn.set_training(training);
            slot.residual.set_training(training);
        }
        self.ffn.set_training(training);
        self.ffn_residual.set_training(training);
    }

    pub fn is_training(&self) -> bool {
        self.ffn_residual.is_training()
    }

    /// Runs the layer.
    ///
    /// * `x`: `(batch, seq, model_dim)` or `(seq, model_dim)`.
    /// * `padding_mask`: self-attention key padding, `(batch, seq)` or `(seq)`.
    /// * `self_attn_mask`: additive `(seq, seq_kv)` mask, e.g. causal.
    /// * `enc_out`: encoder output; required iff the layer has
    ///   encoder-decoder attention.
    /// * `enc_padding_mask`: padding over the encoder sequence.
    /// * `state_bag`: incremental decoding state, passed to both attention
    ///   modules. On error the bag is restored to its state before the call.
    pub fn forward(
        &self,
        x: &Tensor,
        padding_mask: Option<&Tensor>,
        self_attn_mask: Option<&Tensor>,
        enc_out: Option<&Tensor>,
        enc_padding_mask: Option<&Tensor>,
        state_bag: Option<&mut IncrementalStateBag>,
    ) -> Result<Tensor, DecoderError> {
        match (&self.enc_dec_attn, enc_out) {
            (None, Some(_)) => {
                return Err(DecoderError::invalid_argument(
                    "enc_out must be None for decoder-only attention",
                ))
            }
            (Some(_), None) => {
                return Err(DecoderError::invalid_argument(
                    "enc_out must not be None for encoder-decoder attention",
                ))
            }
            _ => {}
        }

        let unbatched = match x.dims() {
            [_, dim] if *dim == self.model_dim => true,
            [_, _, dim] if *dim == self.model_dim => false,
            dims => {
                return Err(DecoderError::invalid_argument(format!(
                    "x must be (batch, seq, {0}) or (seq, {0}), got {dims:?}",
                    self.model_dim
                )))
            }
        };
        let x = batched(x, 2)?;
        let padding_mask = padding_mask.map(|m| batched(m, 1)).transpose()?;
        let enc_out = match enc_out {
            Some(enc) => {
                if enc.dims().last() != Some(&self.model_dim) || !matches!(enc.rank(), 2 | 3) {
                    return Err(DecoderError::invalid_argument(format!(
                        "enc_out must be (batch, seq_src, {0}) or (seq_src, {0}), got {1:?}",
                        self.model_dim,
                        enc.dims()
                    )));
                }
                Some(batched(enc, 2)?)
            }
            None => None,
        };
        let enc_padding_mask = enc_padding_mask.map(|m| batched(m, 1)).transpose()?;

        let mut state_bag = state_bag;
        let snapshot = state_bag.as_deref().map(IncrementalStateBag::snapshot);
        let result = self.forward_sub_blocks(
            &x,
            padding_mask.as_ref(),
            self_attn_mask,
            enc_out.as_ref(),
            enc_padding_mask.as_ref(),
            state_bag.as_deref_mut(),
        );
        let x = match result {
            Ok(x) => x,
            Err(err) => {
                if let (Some(bag), Some(snapshot)) = (state_bag, snapshot) {
                    bag.restore(snapshot);
                }
                return Err(err);
            }
        };

        if unbatched {
            Ok(x.squeeze(0)?)
        } else {
            Ok(x)
        }
    }

    fn forward_sub_blocks(
        &self,
        x: &Tensor,
        padding_mask: Option<&Tensor>,
        self_attn_mask: Option<&Tensor>,
        enc_out: Option<&Tensor>,
        enc_padding_mask: Option<&Tensor>,
        mut state_bag: Option<&mut IncrementalStateBag>,
    ) -> Result<Tensor, DecoderError> {
        let x = self.forward_self_attn(x, padding_mask, self_attn_mask, state_bag.as_deref_mut())?;
        let x = self.forward_enc_dec_attn(&x, enc_out, enc_padding_mask, state_bag)?;
        self.forward_ffn(&x)
    }

    fn pre_norm(&self, norm: &Arc<dyn NormalizationLayer>, x: &Tensor) -> Result<Tensor, DecoderError> {
        if self.options.norm_order.is_pre() {
            Ok(norm.forward(x, &self.policy)?)
        } else {
            Ok(x.clone())
        }
    }

    fn post_norm(&self, norm: &Arc<dyn NormalizationLayer>, x: Tensor) -> Result<Tensor, DecoderError> {
        if self.options.norm_order.is_pre() {
            Ok(x)
        } else {
            Ok(norm.forward(&x, &self.policy)?)
        }
    }

    fn forward_self_attn(
        &self,
        x: &Tensor,
        padding_mask: Option<&Tensor>,
        self_attn_mask: Option<&Tensor>,
        state_bag: Option<&mut IncrementalStateBag>,
    ) -> Result<Tensor, DecoderError> {
        let residual = x;
        let h = self.pre_norm(&self.self_attn_layer_norm, x)?;
        let mut h = self
            .self_attn
            .attend(&h, &h, &h, self_attn_mask, padding_mask, state_bag)?;
        if let Some(norm) = &self.self_attn_norm {
            h = norm.forward(&h, &self.policy)?;
        }
        let out = self.self_attn_residual.step(&h, residual, &self.policy)?;
        self.post_norm(&self.self_attn_layer_norm, out)
    }

    fn forward_enc_dec_attn(
        &self,
        x: &Tensor,
        enc_out: Option<&Tensor>,
        enc_padding_mask: Option<&Tensor>,
        state_bag: Option<&mut IncrementalStateBag>,
    ) -> Result<Tensor, DecoderError> {
        let (slot, enc_out) = match (&self.enc_dec_attn, enc_out) {
            (Some(slot), Some(enc_out)) => (slot, enc_out),
            _ => return Ok(x.clone()),
        };
        let residual = x;
        let h = self.pre_norm(&slot.layer_norm, x)?;
        let h = slot
            .attn
            .attend(&h, enc_out, enc_out, None, enc_padding_mask, state_bag)?;
        let out = slot.residual.step(&h, residual, &self.policy)?;
        self.post_norm(&slot.layer_norm, out)
    }

    fn forward_ffn(&self, x: &Tensor) -> Result<Tensor, DecoderError> {
        let residual = x;
        let h = self.pre_norm(&self.ffn_layer_norm, x)?;
        let h = self.ffn.forward(&h, &self.policy)?;
        let out = self.ffn_residual.step(&h, residual, &self.policy)?;
        self.post_norm(&self.ffn_layer_norm, out)
    }
}

/// Adds a leading batch axis to tensors of rank `unbatched_rank`.
fn batched(tensor: &Tensor, unbatched_rank: usize) -> Result<Tensor, DecoderError> {
    if tensor.rank() == unbatched_rank {
        Ok(tensor.unsqueeze(0)?)
    } else {
        Ok(tensor.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use attention::{MultiheadAttention, MultiheadAttentionConfig};
    use layers::{
        activations::ActivationKind,
        linear::LinearInit,
        mlp::{FeedForward, FeedForwardConfig},
    };
    use static_assertions::assert_impl_all;

    assert_impl_all!(StandardDecoderLayer: Send, Sync);

    fn parts(dim: usize, ffn_dim: usize) -> (Box<dyn Attention>, Box<dyn FeedForwardLayer>) {
        let device = Device::Cpu;
        let attn = MultiheadAttention::with_init(
            MultiheadAttentionConfig::self_attention(dim, 2),
            &device,
            DType::F32,
        )
        .unwrap();
        let ffn = FeedForward::with_init(
            FeedForwardConfig::new(ffn_dim, 4 * ffn_dim, ActivationKind::Relu),
            &LinearInit::XavierUniform,
            &device,
            DType::F32,
        )
        .unwrap();
        (Box::new(attn), Box::new(ffn))
    }

    #[test]
    fn normformer_allocates_extra_norm() {
        let (attn, ffn) = parts(8, 8);
        let options = DecoderLayerOptions {
            norm_order: NormOrder::PreWithNormformer,
            ..Default::default()
        };
        let layer = StandardDecoderLayer::new(attn, None, ffn, options, &Device::Cpu).unwrap();
        assert!(layer.self_attn_norm.is_some());
        assert!(layer.residual_scale().is_none());

        let (attn, ffn) = parts(8, 8);
        let layer = StandardDecoderLayer::new(attn, None, ffn, Default::default(), &Device::Cpu)
            .unwrap();
        assert!(layer.self_attn_norm.is_none());
    }

    #[test]
    fn residual_scale_starts_at_ones() {
        let (attn, ffn) = parts(8, 8);
        let options = DecoderLayerOptions {
            scale_residual: true,
            ..Default::default()
        };
        let layer = StandardDecoderLayer::new(attn, None, ffn, options, &Device::Cpu).unwrap();
        let scale = layer.residual_scale().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(scale, vec![1.0; 8]);
    }

    #[test]
    fn ffn_width_mismatch_is_a_config_error() {
        let (attn, ffn) = parts(8, 16);
        let err = StandardDecoderLayer::new(attn, None, ffn, Default::default(), &Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, DecoderError::Config { .. }), "{err}");
    }

    #[test]
    fn set_training_reaches_every_residual() {
        let (attn, ffn) = parts(8, 8);
        let layer = StandardDecoderLayer::new(attn, None, ffn, Default::default(), &Device::Cpu)
            .unwrap();
        assert!(layer.is_training());
        layer.set_training(false);
        assert!(!layer.is_training());
        assert!(!layer.self_attn_residual.is_training());
    }
}
