//! Scaled dot-product multi-head attention with incremental state support.
//!
//! Queries, keys and values are projected, split into `num_heads` heads of
//! `model_dim / num_heads` features, attended with
//! `softmax(q kᵀ / sqrt(head_dim) + masks) v`, merged and projected back.
//! Scores are reduced in [`PrecisionPolicy::reduction`] so that half-precision
//! parameters still get an `f32` softmax.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    OnceLock,
};

use candle_core::{DType, Device, Tensor};
use candle_nn::ops::{dropout, softmax_last_dim};
use layers::{
    dtypes::PrecisionPolicy,
    linear::{Linear, LinearConfig, LinearInit},
};

use crate::core::{Attention, AttentionError, Config};
use crate::kv_cache::{AttentionState, CacheMode, IncrementalStateBag, ModuleId};
use crate::masks::to_additive;

/// Shape and behaviour of a [`MultiheadAttention`] module.
#[derive(Debug, Clone, PartialEq)]
pub struct MultiheadAttentionConfig {
    pub model_dim: usize,
    pub num_heads: usize,
    /// Whether the four projections carry a bias.
    pub bias: bool,
    pub cache_mode: CacheMode,
    pub attention: Config,
}

impl MultiheadAttentionConfig {
    /// Self-attention configuration: biased projections, appending cache.
    pub fn self_attention(model_dim: usize, num_heads: usize) -> Self {
        Self {
            model_dim,
            num_heads,
            bias: true,
            cache_mode: CacheMode::Appending,
            attention: Config::default(),
        }
    }

    /// Encoder-decoder configuration: keys and values cached once per session.
    pub fn encoder_decoder(model_dim: usize, num_heads: usize) -> Self {
        Self {
            cache_mode: CacheMode::Static,
            ..Self::self_attention(model_dim, num_heads)
        }
    }
}

/// Reference multi-head attention.
#[derive(Debug)]
pub struct MultiheadAttention {
    config: MultiheadAttentionConfig,
    head_dim: usize,
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    output_proj: Linear,
    policy: PrecisionPolicy,
    id: ModuleId,
    training: AtomicBool,
    first_call: OnceLock<()>,
}

impl MultiheadAttention {
    /// Assembles the module from existing projections.
    pub fn new(
        config: MultiheadAttentionConfig,
        q_proj: Linear,
        k_proj: Linear,
        v_proj: Linear,
        output_proj: Linear,
    ) -> Result<Self, AttentionError> {
        let MultiheadAttentionConfig {
            model_dim,
            num_heads,
            ..
        } = config;
        if model_dim == 0 || num_heads == 0 || model_dim % num_heads != 0 {
            return Err(AttentionError::InvalidConfig {
                message: format!(
                    "model_dim ({model_dim}) must be a positive multiple of num_heads ({num_heads})"
                ),
            });
        }
        config.attention.validate()?;

        let dtype = q_proj.weight().dtype();
        for (name, proj) in [
            ("q_proj", &q_proj),
            ("k_proj", &k_proj),
            ("v_proj", &v_proj),
            ("output_proj", &output_proj),
        ] {
            let cfg = proj.config();
            if cfg.input_dim != model_dim || cfg.output_dim != model_dim {
                return Err(AttentionError::InvalidConfig {
                    message: format!(
                        "{name} must map {model_dim} -> {model_dim}, got {} -> {}",
                        cfg.input_dim, cfg.output_dim
                    ),
                });
            }
            if proj.weight().dtype() != dtype {
                return Err(AttentionError::UnsupportedDType {
                    requested: format!(
                        "{name} has dtype {:?} but q_proj has {dtype:?}",
                        proj.weight().dtype()
                    ),
                });
            }
        }

        Ok(Self {
            head_dim: model_dim / num_heads,
            config,
            q_proj,
            k_proj,
            v_proj,
            output_proj,
            policy: PrecisionPolicy::from_parameter_dtype(dtype),
            id: ModuleId::fresh(),
            training: AtomicBool::new(true),
            first_call: OnceLock::new(),
        })
    }

    /// Builds the module with Xavier-initialised projections.
    ///
    /// The input projections use a `1/sqrt(2)` gain, zero biases throughout.
    pub fn with_init(
        config: MultiheadAttentionConfig,
        device: &Device,
        dtype: DType,
    ) -> Result<Self, AttentionError> {
        let mut linear_cfg = LinearConfig::new(config.model_dim, config.model_dim);
        linear_cfg.bias = config.bias;
        let input_init = LinearInit::scaled(LinearInit::XavierUniform, std::f64::consts::FRAC_1_SQRT_2);
        let q_proj = Linear::with_init(linear_cfg.clone(), &input_init, device, dtype)?;
        let k_proj = Linear::with_init(linear_cfg.clone(), &input_init, device, dtype)?;
        let v_proj = Linear::with_init(linear_cfg.clone(), &input_init, device, dtype)?;
        let output_proj = Linear::with_init(linear_cfg, &LinearInit::XavierUniform, device, dtype)?;
        Self::new(config, q_proj, k_proj, v_proj, output_proj)
    }

    pub fn config(&self) -> &MultiheadAttentionConfig {
        &self.config
    }

    /// Key under which this module caches state in an [`IncrementalStateBag`].
    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn num_heads(&self) -> usize {
        self.config.num_heads
    }

    pub fn head_dim(&self) -> usize {
        self.head_dim
    }

    pub fn q_proj(&self) -> &Linear {
        &self.q_proj
    }

    pub fn k_proj(&self) -> &Linear {
        &self.k_proj
    }

    pub fn v_proj(&self) -> &Linear {
        &self.v_proj
    }

    pub fn output_proj(&self) -> &Linear {
        &self.output_proj
    }

    pub fn is_training(&self) -> bool {
        self.training.load(Ordering::Relaxed)
    }

    fn check_input(&self, context: &str, tensor: &Tensor) -> Result<(usize, usize), AttentionError> {
        if !matches!(
            tensor.dtype(),
            DType::F16 | DType::BF16 | DType::F32 | DType::F64
        ) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{context} has dtype {:?}", tensor.dtype()),
            });
        }
        match *tensor.dims() {
            [batch, seq, dim] if dim == self.config.model_dim => Ok((batch, seq)),
            _ => Err(AttentionError::shape(format!(
                "{context} must be (batch, seq, {}), got {:?}",
                self.config.model_dim,
                tensor.dims()
            ))),
        }
    }

    /// `(batch, seq, model_dim)` -> `(batch, heads, seq, head_dim)`.
    fn split_heads(&self, tensor: &Tensor) -> Result<Tensor, AttentionError> {
        let (batch, seq, _) = tensor.dims3()?;
        Ok(tensor
            .reshape((batch, seq, self.config.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?)
    }

    fn project_kv(&self, keys: &Tensor, values: &Tensor) -> Result<(Tensor, Tensor), AttentionError> {
        let k = self.split_heads(&self.k_proj.forward(keys, &self.policy)?)?;
        let v = self.split_heads(&self.v_proj.forward(values, &self.policy)?)?;
        Ok((k, v))
    }

    fn additive_padding(
        &self,
        mask: &Tensor,
        batch: usize,
        k_len: usize,
    ) -> Result<Tensor, AttentionError> {
        if mask.dims() != [batch, k_len] {
            return Err(AttentionError::shape(format!(
                "padding mask must be ({batch}, {k_len}), got {:?}",
                mask.dims()
            )));
        }
        Ok(to_additive(mask, self.policy.compute())?)
    }

    /// Keys, values and key padding after consulting the bag, plus the state
    /// to store once the call succeeds. The bag itself is left untouched.
    fn cached_kv(
        &self,
        bag: &IncrementalStateBag,
        keys: &Tensor,
        values: &Tensor,
        padding: Option<Tensor>,
        batch: usize,
    ) -> Result<CachedKv, AttentionError> {
        let step = bag.step();
        if let Some(prev) = bag.get_state(self.id) {
            let cached_batch = prev.keys().dim(0)?;
            if cached_batch != batch {
                return Err(AttentionError::state(format!(
                    "module {} cached batch {cached_batch} but received batch {batch}",
                    self.id.get()
                )));
            }
        }

        match self.config.cache_mode {
            CacheMode::Static => {
                if let Some(prev) = bag.get_state(self.id) {
                    log::debug!("attention {} static kv cache hit at step {step}", self.id.get());
                    return Ok(CachedKv {
                        keys: prev.keys().clone(),
                        values: prev.values().clone(),
                        key_padding: prev.key_padding().cloned(),
                        pending: None,
                    });
                }
                log::debug!("attention {} static kv cache miss at step {step}", self.id.get());
                let (k, v) = self.project_kv(keys, values)?;
                Ok(CachedKv::pending(k, v, padding, step))
            }
            CacheMode::Appending => {
                let k_len = keys.dim(1)?;
                if let Some(remaining) = bag.remaining_steps() {
                    if k_len > remaining {
                        return Err(AttentionError::state(format!(
                            "{k_len} new positions exceed the {remaining} steps left in the bag"
                        )));
                    }
                }
                let (new_k, new_v) = self.project_kv(keys, values)?;
                match bag.get_state(self.id) {
                    Some(prev) if prev.last_step() == step => Err(AttentionError::state(format!(
                        "module {} already appended at step {step}; advance the bag between calls",
                        self.id.get()
                    ))),
                    Some(prev) => {
                        log::debug!(
                            "attention {} appending {k_len} positions to {} cached",
                            self.id.get(),
                            prev.len()
                        );
                        let padding = merge_padding(prev, padding, batch, k_len)?;
                        Ok(CachedKv::pending(
                            Tensor::cat(&[prev.keys(), &new_k], 2)?,
                            Tensor::cat(&[prev.values(), &new_v], 2)?,
                            padding,
                            step,
                        ))
                    }
                    None => {
                        log::debug!("attention {} starting kv cache at step {step}", self.id.get());
                        Ok(CachedKv::pending(new_k, new_v, padding, step))
                    }
                }
            }
        }
    }
}

/// Keys and values to attend over, with the bag entry they imply.
struct CachedKv {
    keys: Tensor,
    values: Tensor,
    key_padding: Option<Tensor>,
    pending: Option<AttentionState>,
}

impl CachedKv {
    fn pending(keys: Tensor, values: Tensor, key_padding: Option<Tensor>, step: usize) -> Self {
        let state = AttentionState::new(keys.clone(), values.clone(), key_padding.clone(), step);
        Self {
            keys,
            values,
            key_padding,
            pending: Some(state),
        }
    }
}

/// Extends the cached key padding with the padding of `new_len` new keys.
fn merge_padding(
    prev: &AttentionState,
    new: Option<Tensor>,
    batch: usize,
    new_len: usize,
) -> Result<Option<Tensor>, AttentionError> {
    let cached = prev.key_padding().cloned();
    let (cached, new) = match (cached, new) {
        (None, None) => return Ok(None),
        (Some(cached), Some(new)) => (cached, new),
        (Some(cached), None) => {
            let new = Tensor::zeros((batch, new_len), cached.dtype(), cached.device())?;
            (cached, new)
        }
        (None, Some(new)) => {
            let cached = Tensor::zeros((batch, prev.len()), new.dtype(), new.device())?;
            (cached, new)
        }
    };
    Ok(Some(Tensor::cat(&[&cached, &new], 1)?))
}

impl Attention for MultiheadAttention {
    fn model_dim(&self) -> usize {
        self.config.model_dim
    }

    fn attend(
        &self,
        query: &Tensor,
        keys: &Tensor,
        values: &Tensor,
        attn_mask: Option<&Tensor>,
        padding_mask: Option<&Tensor>,
        state_bag: Option<&mut IncrementalStateBag>,
    ) -> Result<Tensor, AttentionError> {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::multihead init id={} model_dim={} heads={} cache={:?} precision={:?} dropout={:?}",
                self.id.get(),
                self.config.model_dim,
                self.config.num_heads,
                self.config.cache_mode,
                self.policy,
                self.config.attention.dropout_p,
            );
        }

        let (batch, q_len) = self.check_input("query", query)?;
        let (k_batch, k_len) = self.check_input("keys", keys)?;
        let (v_batch, v_len) = self.check_input("values", values)?;
        if k_batch != batch || v_batch != batch || v_len != k_len {
            return Err(AttentionError::shape(format!(
                "keys {:?} and values {:?} must match query batch {batch} and each other",
                keys.dims(),
                values.dims()
            )));
        }

        let padding = padding_mask
            .map(|mask| self.additive_padding(mask, batch, k_len))
            .transpose()?;
        let q = self.split_heads(&self.q_proj.forward(query, &self.policy)?)?;
        let CachedKv {
            keys: k,
            values: v,
            key_padding,
            pending,
        } = match state_bag.as_deref() {
            Some(bag) => self.cached_kv(bag, keys, values, padding, batch)?,
            None => {
                let (k, v) = self.project_kv(keys, values)?;
                CachedKv {
                    keys: k,
                    values: v,
                    key_padding: padding,
                    pending: None,
                }
            }
        };

        let heads = self.config.num_heads;
        let head_dim = self.head_dim;
        let k_total = k.dim(2)?;
        let merged = batch * heads;
        if let Some(mask) = attn_mask {
            if mask.dims() != [q_len, k_total] {
                return Err(AttentionError::shape(format!(
                    "attention mask must be ({q_len}, {k_total}), got {:?}",
                    mask.dims()
                )));
            }
        }

        let q_view = self.policy.cast_for_matmul(&q)?.reshape((merged, q_len, head_dim))?;
        let k_view = self.policy.cast_for_matmul(&k)?.reshape((merged, k_total, head_dim))?;
        let v_view = self.policy.cast_for_matmul(&v)?.reshape((merged, k_total, head_dim))?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let scores = (q_view.matmul(&k_view.t()?)? * scale)?;
        let mut scores = self
            .policy
            .cast_for_reduction(&scores.reshape((batch, heads, q_len, k_total))?)?;

        if let Some(mask) = attn_mask {
            scores = scores.broadcast_add(&to_additive(mask, scores.dtype())?)?;
        }
        if let Some(padding) = key_padding {
            let padding = padding
                .to_dtype(scores.dtype())?
                .reshape((batch, 1, 1, k_total))?;
            scores = scores.broadcast_add(&padding)?;
        }

        let mut probs = self.policy.cast_for_matmul(&softmax_last_dim(&scores)?)?;
        let dropout_p = self.config.attention.effective_dropout();
        if dropout_p > 0.0 && self.is_training() {
            probs = dropout(&probs, dropout_p)?;
        }

        let context = probs
            .reshape((merged, q_len, k_total))?
            .matmul(&v_view)?
            .reshape((batch, heads, q_len, head_dim))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, q_len, self.config.model_dim))?;
        let context = self.policy.cast_to_storage(&context)?;
        let output = self.output_proj.forward(&context, &self.policy)?;

        if let (Some(bag), Some(state)) = (state_bag, pending) {
            bag.set_state(self.id, state);
        }
        Ok(output)
    }

    fn set_training(&self, training: bool) {
        self.training.store(training, Ordering::Relaxed);
    }
}
