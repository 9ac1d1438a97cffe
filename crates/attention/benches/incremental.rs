//! Cached single-step decoding against recomputing the whole prefix.
//! Run with: `cargo bench -p attention incremental`

use attention::masks::build_causal_mask;
use attention::{Attention, IncrementalStateBag, MultiheadAttention, MultiheadAttentionConfig};
use candle_core::{DType, Device, Tensor};
use criterion::{black_box, BatchSize, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

fn bench_decode_step(c: &mut Criterion) {
    let device = Device::Cpu;
    let model_dim = 512usize;
    let heads = 8usize;
    let attn = MultiheadAttention::with_init(
        MultiheadAttentionConfig::self_attention(model_dim, heads),
        &device,
        DType::F32,
    )
    .expect("attention init");
    attn.set_training(false);

    let mut group = c.benchmark_group("attention/decode_step");
    for prefix in [32usize, 128, 512] {
        let x = Tensor::randn(0f32, 1.0, (1, prefix + 1, model_dim), &device).expect("input");
        group.throughput(Throughput::Elements(1));

        group.bench_with_input(BenchmarkId::new("full", prefix), &x, |b, x| {
            let mask = build_causal_mask(&device, prefix + 1, prefix + 1).expect("mask");
            b.iter(|| {
                let out = attn.attend(x, x, x, Some(&mask), None, None).expect("attend");
                black_box(out);
            });
        });

        group.bench_with_input(BenchmarkId::new("cached", prefix), &x, |b, x| {
            let head = x.narrow(1, 0, prefix).expect("prefix");
            let last = x.narrow(1, prefix, 1).expect("last");
            let mask = build_causal_mask(&device, prefix, prefix).expect("mask");
            b.iter_batched(
                || {
                    let mut bag = IncrementalStateBag::new(None);
                    attn.attend(&head, &head, &head, Some(&mask), None, Some(&mut bag))
                        .expect("prefill");
                    bag.increment_step(prefix).expect("advance");
                    bag
                },
                |mut bag| {
                    let out = attn
                        .attend(&last, &last, &last, None, None, Some(&mut bag))
                        .expect("step");
                    black_box(out);
                },
                BatchSize::SmallInput,
            );
        });
    }
    group.finish();
}

criterion_group!(benches, bench_decode_step);
criterion_main!(benches);
