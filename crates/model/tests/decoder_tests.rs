mod common;

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use anyhow::Result;
use attention::{
    masks::padding_mask_from_lengths, Attention, AttentionError, IncrementalStateBag,
    MultiheadAttention, MultiheadAttentionConfig,
};
use candle_core::{DType, Device, Tensor};
use common::{max_abs_diff, zero_attention, CallLog, DoublingFfn};
use model::{
    build_decoder, DecoderConfig, DecoderError, DecoderLayerOptions, NormOrder,
    StandardDecoderLayer, TransformerDecoder,
};

fn small_config(order: NormOrder, encoder_decoder: bool) -> DecoderConfig {
    let mut config = DecoderConfig {
        model_dim: 16,
        num_layers: 2,
        num_heads: 4,
        ffn_inner_dim: 32,
        encoder_decoder,
        seed: 11,
        ..Default::default()
    };
    config.layer.norm_order = order;
    config
}

/// Attention that errors while `fail` is set.
struct SwitchableAttention {
    model_dim: usize,
    fail: Arc<AtomicBool>,
}

impl Attention for SwitchableAttention {
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
        if self.fail.load(Ordering::Relaxed) {
            return Err(AttentionError::Backend {
                message: "switched off".to_string(),
            });
        }
        Ok(query.zeros_like()?)
    }
}

fn stub_layer(dim: usize, log: &CallLog) -> Result<StandardDecoderLayer> {
    Ok(StandardDecoderLayer::new(
        zero_attention(dim, "self_attn", log),
        None,
        Box::new(DoublingFfn::new(dim, log)),
        DecoderLayerOptions::default(),
        &Device::Cpu,
    )?)
}

#[test]
fn final_norm_exists_only_for_pre_orders() -> Result<()> {
    for (order, expected) in [
        (NormOrder::Post, false),
        (NormOrder::Pre, true),
        (NormOrder::PreWithNormformer, true),
    ] {
        let decoder = build_decoder(&small_config(order, false), &Device::Cpu)?;
        assert_eq!(decoder.has_final_norm(), expected, "{order}");
        assert_eq!(decoder.layers().len(), 2);
        assert_eq!(decoder.norm_order(), order);
    }
    Ok(())
}

#[test]
fn stack_construction_errors() -> Result<()> {
    let err = TransformerDecoder::new(Vec::new(), NormOrder::Pre, 1e-5, &Device::Cpu).unwrap_err();
    assert!(matches!(err, DecoderError::Config { .. }), "{err}");

    let log = CallLog::default();
    let layers = vec![stub_layer(8, &log)?, stub_layer(16, &log)?];
    let err = TransformerDecoder::new(layers, NormOrder::Post, 1e-5, &Device::Cpu).unwrap_err();
    assert!(matches!(err, DecoderError::Config { .. }), "{err}");

    let bad = DecoderConfig {
        model_dim: 15,
        ..small_config(NormOrder::Pre, false)
    };
    let err = build_decoder(&bad, &Device::Cpu).unwrap_err();
    assert!(matches!(err, DecoderError::Validation(_)), "{err}");
    Ok(())
}

#[test]
fn forward_advances_the_bag_by_processed_positions() -> Result<()> {
    let device = Device::Cpu;
    let decoder = build_decoder(&small_config(NormOrder::Post, false), &device)?;
    decoder.set_training(false);

    let x = Tensor::randn(0f32, 1.0, (1, 3, 16), &device)?;
    let mut bag = IncrementalStateBag::new(None);
    let out = decoder.forward_causal(&x, None, None, None, Some(&mut bag))?;
    assert_eq!(out.dims(), x.dims());
    assert_eq!(bag.step(), 3);
    assert_eq!(bag.len(), 2);

    let next = Tensor::randn(0f32, 1.0, (1, 1, 16), &device)?;
    decoder.forward_causal(&next, None, None, None, Some(&mut bag))?;
    assert_eq!(bag.step(), 4);
    Ok(())
}

#[test]
fn exhausted_bag_is_reported() -> Result<()> {
    let device = Device::Cpu;
    let decoder = build_decoder(&small_config(NormOrder::Pre, false), &device)?;
    let x = Tensor::randn(0f32, 1.0, (1, 3, 16), &device)?;
    let mut bag = IncrementalStateBag::new(Some(2));
    assert!(decoder.forward_causal(&x, None, None, None, Some(&mut bag)).is_err());
    Ok(())
}

#[test]
fn incremental_stack_matches_full_sequence() -> Result<()> {
    let device = Device::Cpu;
    for order in [NormOrder::Post, NormOrder::Pre, NormOrder::PreWithNormformer] {
        let mut config = small_config(order, true);
        config.layer.scale_residual = true;
        let decoder = build_decoder(&config, &device)?;
        decoder.set_training(false);

        let x = Tensor::randn(0f32, 1.0, (2, 6, 16), &device)?;
        let enc = Tensor::randn(0f32, 1.0, (2, 5, 16), &device)?;
        let enc_padding = padding_mask_from_lengths(&device, &[5, 3], 5)?;

        let full = decoder.forward_causal(&x, None, Some(&enc), Some(&enc_padding), None)?;

        let mut bag = IncrementalStateBag::new(Some(6));
        let mut pieces = vec![decoder.forward_causal(
            &x.narrow(1, 0, 2)?,
            None,
            Some(&enc),
            Some(&enc_padding),
            Some(&mut bag),
        )?];
        for pos in 2..6 {
            pieces.push(decoder.forward_causal(
                &x.narrow(1, pos, 1)?,
                None,
                Some(&enc),
                Some(&enc_padding),
                Some(&mut bag),
            )?);
        }
        assert_eq!(bag.step(), 6);
        let incremental = Tensor::cat(&pieces, 1)?;
        assert!(max_abs_diff(&full, &incremental)? < 1e-5, "{order}");
    }
    Ok(())
}

#[test]
fn stack_feeds_each_layer_the_previous_output() -> Result<()> {
    let device = Device::Cpu;
    let log = CallLog::default();
    let layers = vec![stub_layer(4, &log)?, stub_layer(4, &log)?];
    let decoder = TransformerDecoder::new(layers, NormOrder::Post, 1e-5, &device)?;
    decoder.set_training(false);

    // Post-norm layers with unit norms; the row below is already zero mean.
    let x = Tensor::new(&[[1f32, -1.0, 1.0, -1.0]], &device)?;
    let out = decoder.forward(&x, None, None, None, None, None)?;
    assert_eq!(log.take(), ["self_attn", "ffn", "self_attn", "ffn"]);
    assert!(max_abs_diff(&out, &x)? < 1e-3);
    Ok(())
}

#[test]
fn stack_rejects_layers_with_another_norm_order() -> Result<()> {
    let log = CallLog::default();
    let layers = vec![stub_layer(8, &log)?, stub_layer(8, &log)?];
    let err = TransformerDecoder::new(layers, NormOrder::Pre, 1e-5, &Device::Cpu).unwrap_err();
    assert!(matches!(err, DecoderError::Config { .. }), "{err}");
    assert!(err.to_string().contains("norm order"), "{err}");
    Ok(())
}

#[test]
fn failing_later_layer_rolls_back_earlier_layers() -> Result<()> {
    let device = Device::Cpu;
    let log = CallLog::default();
    let options = DecoderLayerOptions {
        dropout_p: 0.0,
        ..Default::default()
    };
    let caching = StandardDecoderLayer::new(
        Box::new(MultiheadAttention::with_init(
            MultiheadAttentionConfig::self_attention(8, 2),
            &device,
            DType::F32,
        )?),
        None,
        Box::new(DoublingFfn::new(8, &log)),
        options.clone(),
        &device,
    )?;
    let fail = Arc::new(AtomicBool::new(true));
    let switchable = StandardDecoderLayer::new(
        Box::new(SwitchableAttention {
            model_dim: 8,
            fail: fail.clone(),
        }),
        None,
        Box::new(DoublingFfn::new(8, &log)),
        options,
        &device,
    )?;
    let decoder = TransformerDecoder::new(vec![caching, switchable], NormOrder::Post, 1e-5, &device)?;
    decoder.set_training(false);

    let x = Tensor::randn(0f32, 1.0, (1, 3, 8), &device)?;
    let mut bag = IncrementalStateBag::new(None);
    let err = decoder
        .forward_causal(&x, None, None, None, Some(&mut bag))
        .unwrap_err();
    assert!(matches!(err, DecoderError::Attention(_)), "{err}");
    assert!(bag.is_empty());
    assert_eq!(bag.step(), 0);

    fail.store(false, Ordering::Relaxed);
    let retried = decoder.forward_causal(&x, None, None, None, Some(&mut bag))?;
    let full = decoder.forward_causal(&x, None, None, None, None)?;
    assert!(max_abs_diff(&retried, &full)? < 1e-6);
    assert_eq!(bag.step(), 3);
    assert_eq!(bag.len(), 1);
    Ok(())
}

#[test]
fn bad_encoder_padding_leaves_the_session_retryable() -> Result<()> {
    let device = Device::Cpu;
    let decoder = build_decoder(&small_config(NormOrder::Pre, true), &device)?;
    decoder.set_training(false);
    let x = Tensor::randn(0f32, 1.0, (2, 2, 16), &device)?;
    let enc = Tensor::randn(0f32, 1.0, (2, 5, 16), &device)?;

    let mut bag = IncrementalStateBag::new(Some(4));
    let bad_padding = padding_mask_from_lengths(&device, &[4, 3], 4)?;
    let err = decoder
        .forward_causal(&x, None, Some(&enc), Some(&bad_padding), Some(&mut bag))
        .unwrap_err();
    assert!(matches!(err, DecoderError::Attention(_)), "{err}");
    assert!(bag.is_empty());
    assert_eq!(bag.step(), 0);

    let padding = padding_mask_from_lengths(&device, &[5, 3], 5)?;
    decoder.forward_causal(&x, None, Some(&enc), Some(&padding), Some(&mut bag))?;
    assert_eq!(bag.step(), 2);
    assert_eq!(bag.len(), 4);
    Ok(())
}
