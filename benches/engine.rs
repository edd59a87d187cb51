//! Criterion benchmarks for the gridnet engine.
//!
//! Run with:
//!   cargo bench
//!   cargo bench --features simd
//!
//! Results are saved to target/criterion/

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use gridnet::prelude::*;

fn mnist_shaped<T: Scalar>(hidden: usize) -> Network<T> {
    Network::create(
        &[(28, 28), (hidden, 1), (10, 1)],
        &[Activation::Linear, Activation::Relu, Activation::Softmax],
        &[true, true, true],
        Some(42),
    )
    .unwrap()
}

fn image(seed: u64) -> Vec<Vec<f64>> {
    let mut s = seed;
    (0..28)
        .map(|_| {
            (0..28)
                .map(|_| {
                    s = s.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    (s >> 40) as f64 / (1u64 << 24) as f64
                })
                .collect()
        })
        .collect()
}

/// Forward with varying hidden widths.
fn bench_forward_sizes(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward_size");
    let input = image(1);

    for hidden in [32usize, 128, 512].iter() {
        group.throughput(Throughput::Elements((784 * hidden + hidden * 10) as u64));
        group.bench_with_input(BenchmarkId::new("f32", hidden), hidden, |b, &hidden| {
            let mut net = mnist_shaped::<f32>(hidden);
            b.iter(|| {
                net.forward(black_box(&input)).unwrap();
                black_box(net.output())
            });
        });
    }

    group.finish();
}

/// Connection path against baked dense rows (SIMD with `--features simd`).
fn bench_forward_baked(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward_baked");
    let input = image(2);

    group.bench_function("connections_128", |b| {
        let mut net = mnist_shaped::<f32>(128);
        b.iter(|| {
            net.forward(black_box(&input)).unwrap();
            black_box(net.output())
        });
    });

    group.bench_function("baked_128", |b| {
        let mut net = mnist_shaped::<f32>(128);
        net.bake();
        b.iter(|| {
            net.forward(black_box(&input)).unwrap();
            black_box(net.output())
        });
    });

    group.finish();
}

/// Saturating integer arithmetic against floats.
fn bench_scalar_types(c: &mut Criterion) {
    let mut group = c.benchmark_group("scalar_type");
    let input = image(3);

    group.bench_function("i16", |b| {
        let mut net = mnist_shaped::<i16>(64);
        b.iter(|| {
            net.forward(black_box(&input)).unwrap();
            black_box(net.output())
        });
    });

    group.bench_function("f64", |b| {
        let mut net = mnist_shaped::<f64>(64);
        b.iter(|| {
            net.forward(black_box(&input)).unwrap();
            black_box(net.output())
        });
    });

    group.finish();
}

fn bench_train_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("train_step");
    let input = image(4);
    let mut target = vec![vec![0.0; 10]];
    target[0][3] = 1.0;

    group.bench_function("f32_128", |b| {
        let mut net = mnist_shaped::<f32>(128);
        b.iter(|| {
            net.forward(&input).unwrap();
            net.backward(black_box(&target), 0.01, 1.0, -1.0).unwrap();
        });
    });

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    let mut net = mnist_shaped::<f32>(64);
    let bytes = net.to_binary().unwrap();
    group.throughput(Throughput::Bytes(bytes.len() as u64));

    group.bench_function("encode_binary", |b| {
        b.iter(|| black_box(net.to_binary().unwrap()));
    });
    group.bench_function("decode_binary", |b| {
        b.iter(|| black_box(Network::<f32>::from_binary(black_box(&bytes)).unwrap()));
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_forward_sizes,
    bench_forward_baked,
    bench_scalar_types,
    bench_train_step,
    bench_codec,
);
criterion_main!(benches);
