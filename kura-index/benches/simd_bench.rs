//! SIMD distance kernel benchmarks: dispatched path vs scalar reference.
//!
//! Run with: cargo bench --package kura-index

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use rand::Rng;

fn random_vec(dim: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..dim).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn bench_l2_sq(c: &mut Criterion) {
    let dims = [128, 384, 768, 1536];

    let mut group = c.benchmark_group("l2_sq");

    for dim in dims {
        let a = random_vec(dim);
        let b = random_vec(dim);

        group.throughput(Throughput::Elements(1));
        group.bench_function(format!("simd_dim_{}", dim), |bencher| {
            bencher.iter(|| black_box(kura_index::simd::l2_sq(black_box(&a), black_box(&b))))
        });
        group.bench_function(format!("ref_dim_{}", dim), |bencher| {
            bencher.iter(|| black_box(kura_index::simd::l2_sq_ref(black_box(&a), black_box(&b))))
        });
    }

    group.finish();
}

fn bench_cosine(c: &mut Criterion) {
    let dims = [128, 768];

    let mut group = c.benchmark_group("cosine");

    for dim in dims {
        let a = random_vec(dim);
        let b = random_vec(dim);

        group.throughput(Throughput::Elements(1));
        group.bench_function(format!("dim_{}", dim), |bencher| {
            bencher.iter(|| black_box(kura_index::simd::cosine(black_box(&a), black_box(&b))))
        });
    }

    group.finish();
}

fn bench_codec(c: &mut Criterion) {
    let vec = random_vec(768);
    let raw = kura_index::codec::serialize(&vec);

    let mut group = c.benchmark_group("codec");
    group.bench_function("serialize_768", |bencher| {
        bencher.iter(|| black_box(kura_index::codec::serialize(black_box(&vec))))
    });
    group.bench_function("deserialize_768", |bencher| {
        bencher.iter(|| black_box(kura_index::codec::deserialize(black_box(&raw))))
    });
    group.finish();
}

criterion_group!(benches, bench_l2_sq, bench_cosine, bench_codec);
criterion_main!(benches);
