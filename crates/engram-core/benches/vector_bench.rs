//! Vector-kernel benchmarks: quantization, int8 cosine, and the
//! Hamming prefilter over a synthetic corpus.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use engram_core::{cosine_int8, hamming_distance, quantize_int8, to_binary, top_k_hamming};

const DIM: usize = 768;
const CORPUS: usize = 10_000;

fn synthetic_vector(seed: u64) -> Vec<f32> {
    let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1);
    (0..DIM)
        .map(|_| {
            state = state
                .wrapping_mul(6364136223846793005)
                .wrapping_add(1442695040888963407);
            ((state >> 33) as f32 / (u32::MAX >> 1) as f32) - 1.0
        })
        .collect()
}

fn bench_quantize(c: &mut Criterion) {
    let v = synthetic_vector(1);
    c.bench_function("quantize_int8_768d", |b| {
        b.iter(|| quantize_int8(black_box(&v)).unwrap())
    });
}

fn bench_cosine(c: &mut Criterion) {
    let (a, _, _) = quantize_int8(&synthetic_vector(1)).unwrap();
    let (b2, _, _) = quantize_int8(&synthetic_vector(2)).unwrap();
    c.bench_function("cosine_int8_768d", |b| {
        b.iter(|| cosine_int8(black_box(&a), black_box(&b2)).unwrap())
    });
}

fn bench_hamming(c: &mut Criterion) {
    let (qa, _, _) = quantize_int8(&synthetic_vector(1)).unwrap();
    let (qb, _, _) = quantize_int8(&synthetic_vector(2)).unwrap();
    let a = to_binary(&qa).unwrap();
    let b2 = to_binary(&qb).unwrap();
    c.bench_function("hamming_768d", |b| {
        b.iter(|| hamming_distance(black_box(&a), black_box(&b2)).unwrap())
    });
}

fn bench_binary_prefilter(c: &mut Criterion) {
    let corpus: Vec<Vec<u8>> = (0..CORPUS as u64)
        .map(|seed| {
            let (q, _, _) = quantize_int8(&synthetic_vector(seed)).unwrap();
            to_binary(&q).unwrap()
        })
        .collect();
    let (query, _, _) = quantize_int8(&synthetic_vector(99)).unwrap();
    let query_bits = to_binary(&query).unwrap();

    c.bench_function("top_k_hamming_10k_corpus", |b| {
        b.iter(|| top_k_hamming(black_box(&query_bits), black_box(&corpus), 100).unwrap())
    });
}

criterion_group!(
    benches,
    bench_quantize,
    bench_cosine,
    bench_hamming,
    bench_binary_prefilter
);
criterion_main!(benches);
