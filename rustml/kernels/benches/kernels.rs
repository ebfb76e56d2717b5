use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustml_kernels::*;

fn random_vec(rng: &mut StdRng, n: usize) -> Vec<f32> {
    (0..n).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

fn bench_gemv(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(42);
    let mut group = c.benchmark_group("gemv");
    for &(rows, cols) in &[(256usize, 256usize), (1024, 1024), (4096, 1024)] {
        let w = random_vec(&mut rng, rows * cols);
        let x = random_vec(&mut rng, cols);
        let mut y = vec![0.0; rows];
        group.bench_with_input(BenchmarkId::new("f32", format!("{}x{}", rows, cols)), &(), |b, _| {
            b.iter(|| gemv(WeightView::F32(black_box(&w)), rows, cols, black_box(&x), None, &mut y))
        });
        group.bench_with_input(BenchmarkId::new("ref", format!("{}x{}", rows, cols)), &(), |b, _| {
            b.iter(|| gemv_ref(black_box(&w), rows, cols, black_box(&x), None, &mut y))
        });
    }
    group.finish();
}

fn bench_attention(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(43);
    let layout = HeadLayout::new(8, 2, 64).unwrap();
    let t = 256;
    let q = random_vec(&mut rng, t * layout.q_width());
    let k = random_vec(&mut rng, t * layout.kv_width());
    let v = random_vec(&mut rng, t * layout.kv_width());
    let mask = AttentionMask::causal(0);
    let mut out = vec![0.0; t * layout.q_width()];

    let mut group = c.benchmark_group("attention");
    for strategy in [AttentionStrategy::Materialized, AttentionStrategy::Recompute, AttentionStrategy::Flash] {
        let mut work = vec![0.0; layout.work_len(strategy, t, t)];
        group.bench_function(format!("{:?}", strategy), |b| {
            b.iter(|| {
                multi_head_forward(strategy, &layout, t, t, black_box(&q), &k, &v, &mask, &mut work, &mut out).unwrap()
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_gemv, bench_attention);
criterion_main!(benches);
