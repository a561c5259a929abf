use burn_core::tensor::backend::Backend;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use ndarray::Array2;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, StandardNormal};

use anode::block::{OdeBlock, Selector, TimeSpan};
use anode::data::ndarray_to_burn_2;
use anode::field::{NfeCounter, VectorFieldConfig};
use anode::ode::SolverOptions;
use anode::sensitivity::GradientMode;
use anode::train::mse;
use anode::BurnBackend;

fn make_batch(n: usize, d: usize, seed: u64) -> Array2<f32> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut x = Array2::<f32>::zeros((n, d));
    for i in 0..n {
        for k in 0..d {
            let v: f32 = StandardNormal.sample(&mut rng);
            x[[i, k]] = v;
        }
    }
    x
}

fn block(state_dim: usize, data_dim: usize, tol: f64) -> OdeBlock<BurnBackend> {
    let device = <BurnBackend as Backend>::Device::default();
    let field = VectorFieldConfig::new(state_dim, 20).init::<BurnBackend>(&device, 123);
    OdeBlock::new(
        field,
        TimeSpan::default(),
        SolverOptions::with_tol(tol),
        Selector::new(data_dim),
    )
    .unwrap()
}

fn bench_forward(c: &mut Criterion) {
    let mut group = c.benchmark_group("ode_forward");
    group.sample_size(30);

    let device = <BurnBackend as Backend>::Device::default();
    for &(n, d, extra) in &[(50usize, 1usize, 0usize), (50, 1, 1), (50, 4, 2)] {
        let z0 = ndarray_to_burn_2::<BurnBackend>(&device, &make_batch(n, d + extra, 7));
        for &tol in &[1e-3, 1e-5] {
            let blk = block(d + extra, d, tol).valid();
            let z0 = z0.clone().inner();
            group.bench_with_input(
                BenchmarkId::new(format!("tol{tol:e}"), format!("n{n}_d{d}_x{extra}")),
                &(n, d),
                |b, _| {
                    b.iter(|| {
                        let mut nfe = NfeCounter::new();
                        blk.forward(z0.clone(), &mut nfe).unwrap()
                    })
                },
            );
        }
    }
    group.finish();
}

fn bench_gradients(c: &mut Criterion) {
    let mut group = c.benchmark_group("ode_gradients");
    group.sample_size(20);

    let device = <BurnBackend as Backend>::Device::default();
    for &(n, d, extra) in &[(50usize, 1usize, 1usize), (50, 4, 2)] {
        let z0 = ndarray_to_burn_2::<BurnBackend>(&device, &make_batch(n, d + extra, 11));
        let zn = ndarray_to_burn_2::<BurnBackend>(&device, &make_batch(n, d, 13));
        let blk = block(d + extra, d, 1e-3);

        for mode in [GradientMode::Direct, GradientMode::Adjoint] {
            let strategy = mode.strategy::<BurnBackend>();
            group.bench_with_input(
                BenchmarkId::new(mode.to_string(), format!("n{n}_d{d}_x{extra}")),
                &(n, d),
                |b, _| {
                    b.iter(|| {
                        let mut nfe = NfeCounter::new();
                        let endpoint = strategy.solve(&blk, z0.clone(), &mut nfe).unwrap();
                        let pred = blk.project(endpoint.clone()).unwrap();
                        let loss = mse(pred, zn.clone());
                        strategy.backward(&blk, &endpoint, loss, &mut nfe).unwrap()
                    })
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_forward, bench_gradients);
criterion_main!(benches);
