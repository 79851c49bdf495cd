use criterion::{criterion_group, criterion_main, Criterion};
use ndarray::{Array1, Array2, Axis};
use ndarray_rand::rand::SeedableRng;
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand_xoshiro::Xoshiro256Plus;
use surrogate_gp::kernels::{ConstantKernel, SquaredExponentialKernel};
use surrogate_gp::{CholeskyBackend, GpParams};

fn griewank(x: &Array2<f64>) -> Array1<f64> {
    let dim = x.ncols();
    let d = Array1::linspace(1., dim as f64, dim).mapv(|v| v.sqrt());
    x.map_axis(Axis(1), |row| {
        row.mapv(|v| v * v).sum() / 4000.
            - (&row / &d).mapv(|v| v.cos()).fold(1., |acc, v| acc * v)
            + 1.0
    })
}

fn criterion_gp(c: &mut Criterion) {
    let dims = [1, 5];
    let nts = [50, 100];

    let mut group = c.benchmark_group("gp");
    group.sample_size(20);
    for (&dim, &nt) in dims.iter().zip(nts.iter()) {
        let mut rng = Xoshiro256Plus::seed_from_u64(42);
        let xt = Array2::random_using((nt, dim), Uniform::new(-10., 10.), &mut rng);
        let yt = griewank(&xt);
        let xtest = Array2::random_using((200, dim), Uniform::new(-10., 10.), &mut rng);

        let kernel = ConstantKernel::default()
            * SquaredExponentialKernel::ard(Array1::ones(dim)).expect("valid length scales");
        let backend = CholeskyBackend::new(kernel).nugget(1e-8);

        group.bench_function(format!("train {dim}d x {nt}"), |b| {
            b.iter(|| {
                let mut gp = GpParams::new(backend.clone()).build().expect("valid params");
                gp.train(&xt, &yt, true).expect("GP training");
                std::hint::black_box(gp)
            });
        });

        let mut gp = GpParams::new(backend.clone()).build().expect("valid params");
        gp.train(&xt, &yt, true).expect("GP training");
        group.bench_function(format!("predict_valcov {dim}d x {nt}"), |b| {
            b.iter(|| std::hint::black_box(gp.predict_valcov(&xtest).expect("GP prediction")));
        });
        group.bench_function(format!("sample_functions {dim}d x {nt}"), |b| {
            b.iter(|| std::hint::black_box(gp.sample_functions(&xtest, 10).expect("GP sampling")));
        });
    }
    group.finish();
}

criterion_group!(benches, criterion_gp);
criterion_main!(benches);
