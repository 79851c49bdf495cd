use env_logger::{Builder, Env};
use ndarray::{arr2, concatenate, Array, Array1, Array2, Axis};
use surrogate_gp::kernels::{ConstantKernel, SquaredExponentialKernel};
use surrogate_gp::priors::HyperPrior;
use surrogate_gp::{CholeskyBackend, GpParams};

fn xsinx(x: &Array2<f64>) -> Array1<f64> {
    ((x - 3.5) * ((x - 3.5) / std::f64::consts::PI).mapv(|v| v.sin())).remove_axis(Axis(1))
}

fn main() {
    Builder::from_env(Env::new().filter_or("SURROGATE_GP_LOG", "info")).init();

    let xt = arr2(&[[0.0], [5.0], [10.0], [15.0], [18.0], [20.0], [25.0]]);
    let yt = xsinx(&xt);

    let kernel = ConstantKernel::default() * SquaredExponentialKernel::default();
    let backend = CholeskyBackend::new(kernel).nugget(1e-10);
    let mut gp = GpParams::new(backend)
        .prior(HyperPrior::normal(1., 2.).expect("valid prior"))
        .build()
        .expect("valid GP parameters");

    println!("Train GP surrogate of 'xsinx' at {}", xt.column(0));
    gp.train(&xt, &yt, true).expect("GP training");
    println!("{gp}");

    let xtest = Array::linspace(0., 25., 26).insert_axis(Axis(1));
    let ytest = xsinx(&xtest);
    let (ypred, yvar) = gp.predict_valvar(&xtest).expect("GP prediction");
    let ysigma = yvar.mapv(f64::sqrt);

    println!("Compute prediction errors (x, err(x), sigma(x))");
    println!(
        "{}",
        concatenate![
            Axis(1),
            xtest,
            (ypred - ytest).insert_axis(Axis(1)),
            ysigma.insert_axis(Axis(1))
        ]
    );

    let samples = gp.sample_functions(&xtest, 3).expect("GP sampling");
    println!("Sampled functions at x = 0, 12, 25:");
    for sample in samples.rows() {
        println!("{} {} {}", sample[0], sample[12], sample[25]);
    }
}
