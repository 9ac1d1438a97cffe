//! Decoder layer forward throughput per norm order.
//! Run with: `cargo bench -p model decoder_layer`

use attention::masks::build_causal_mask;
use candle_core::{Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use model::{build_decoder, DecoderConfig, NormOrder};

fn bench_layer_forward(c: &mut Criterion) {
    let device = Device::Cpu;
    let (batch, seq) = (4usize, 64usize);

    let mut group = c.benchmark_group("decoder_layer/forward");
    group.throughput(Throughput::Elements((batch * seq) as u64));
    for order in [NormOrder::Post, NormOrder::Pre, NormOrder::PreWithNormformer] {
        let mut config = DecoderConfig {
            model_dim: 256,
            num_layers: 1,
            num_heads: 4,
            ffn_inner_dim: 1024,
            ..Default::default()
        };
        config.layer.norm_order = order;
        let decoder = build_decoder(&config, &device).expect("decoder");
        decoder.set_training(false);
        let layer = &decoder.layers()[0];

        let x = Tensor::randn(0f32, 1.0, (batch, seq, config.model_dim), &device).expect("input");
        let mask = build_causal_mask(&device, seq, seq).expect("mask");
        group.bench_with_input(BenchmarkId::from_parameter(order), &x, |b, x| {
            b.iter(|| {
                let out = layer
                    .forward(x, None, Some(&mask), None, None, None)
                    .expect("forward");
                black_box(out);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_layer_forward);
criterion_main!(benches);
