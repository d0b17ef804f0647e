use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use nutmeg::test_models::NormalLogp;
use nutmeg::{
    AdaptOptions, DiagMetric, Hamiltonian, Metric, NutsChain, NutsOptions,
};
use rand::rngs::SmallRng;
use rand::SeedableRng;

fn make_chain(dim: usize, mu: f64, seed: u64) -> NutsChain<NormalLogp, SmallRng> {
    let logp = NormalLogp::new(dim, mu);
    let hamiltonian = Hamiltonian::new(logp, Metric::Diag(DiagMetric::new(dim)), 0.1, 1000.);
    NutsChain::new(
        hamiltonian,
        AdaptOptions::default(),
        200,
        NutsOptions { maxdepth: 10 },
        SmallRng::seed_from_u64(seed),
        0,
        &vec![3.5; dim],
    )
    .expect("Normal density is finite everywhere")
}

fn criterion_benchmark(c: &mut Criterion) {
    for dim in [10usize, 1000] {
        c.bench_function(&format!("make chain normal {dim}"), |b| {
            b.iter(|| make_chain(black_box(dim), black_box(3.), black_box(42)))
        });

        c.bench_function(&format!("draw normal {dim}"), |b| {
            b.iter_batched(
                || make_chain(dim, 3., 42),
                |mut chain| {
                    let (position, _stats) = chain.draw().unwrap();
                    black_box(position);
                },
                BatchSize::SmallInput,
            )
        });

        c.bench_function(&format!("warmup and 100 draws normal {dim}"), |b| {
            b.iter_batched(
                || make_chain(dim, 3., 42),
                |mut chain| {
                    for _ in 0..300 {
                        let (position, _stats) = chain.draw().unwrap();
                        black_box(position);
                    }
                },
                BatchSize::SmallInput,
            )
        });
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
