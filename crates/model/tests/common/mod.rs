//! Recording stand-ins for attention, feed-forward and norm modules.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use attention::{Attention, AttentionError, IncrementalStateBag};
use candle_core::{Result as CandleResult, Tensor};
use layers::{
    activations::ActivationKind,
    dtypes::PrecisionPolicy,
    mlp::{FeedForwardConfig, FeedForwardLayer},
    norm::{NormConfig, NormKind, NormalizationLayer},
};

/// Shared call log.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn take(&self) -> Vec<String> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

/// Identity norm that records its tag on every call.
pub struct TaggingNorm {
    config: NormConfig,
    tag: String,
    log: CallLog,
}

impl NormalizationLayer for TaggingNorm {
    fn config(&self) -> &NormConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, _policy: &PrecisionPolicy) -> CandleResult<Tensor> {
        self.log.push(self.tag.clone());
        Ok(hidden.clone())
    }
}

/// Hands out tagged norms; tags are consumed in construction order.
pub fn tagging_factory(
    log: &CallLog,
    tags: &[&str],
) -> impl Fn(usize, f64) -> CandleResult<Arc<dyn NormalizationLayer>> {
    let log = log.clone();
    let tags: Vec<String> = tags.iter().map(|t| t.to_string()).collect();
    let next = Mutex::new(0usize);
    move |dim, eps| {
        let mut next = next.lock().unwrap();
        let tag = tags
            .get(*next)
            .cloned()
            .unwrap_or_else(|| format!("norm{next}"));
        *next += 1;
        Ok(Arc::new(TaggingNorm {
            config: NormConfig::new(dim, NormKind::LayerNorm).with_epsilon(eps),
            tag,
            log: log.clone(),
        }) as Arc<dyn NormalizationLayer>)
    }
}

/// Attention returning zeros shaped like the query.
pub struct ZeroAttention {
    pub model_dim: usize,
    pub tag: &'static str,
    pub log: CallLog,
}

impl Attention for ZeroAttention {
    fn model_dim(&self) -> usize {
        self.model_dim
    }

    fn attend(
        &self,
        query: &Tensor,
        _keys: &Tensor,
        _values: &Tensor,
        _attn_mask: Option<&Tensor>,
        _padding_mask: Option<&Tensor>,
        _state_bag: Option<&mut IncrementalStateBag>,
    ) -> std::result::Result<Tensor, AttentionError> {
        self.log.push(self.tag);
        Ok(query.zeros_like()?)
    }
}

/// Feed-forward network computing `2 * x`.
pub struct DoublingFfn {
    config: FeedForwardConfig,
    log: CallLog,
}

impl DoublingFfn {
    pub fn new(model_dim: usize, log: &CallLog) -> Self {
        Self {
            config: FeedForwardConfig::new(model_dim, model_dim, ActivationKind::Identity),
            log: log.clone(),
        }
    }
}

impl FeedForwardLayer for DoublingFfn {
    fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    fn forward(&self, hidden: &Tensor, _policy: &PrecisionPolicy) -> CandleResult<Tensor> {
        self.log.push("ffn");
        hidden.affine(2.0, 0.0)
    }
}

pub fn zero_attention(model_dim: usize, tag: &'static str, log: &CallLog) -> Box<dyn Attention> {
    Box::new(ZeroAttention {
        model_dim,
        tag,
        log: log.clone(),
    })
}

/// Largest absolute element-wise difference.
pub fn max_abs_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
    a.sub(b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
}
