//! A module for covariance kernels used by the GP surrogate.
//!
//! Every kernel exposes its free hyperparameters as a vector `theta` on a natural-log
//! scale together with log-space bounds, and computes the covariance matrix of a set of
//! points along with its gradient with respect to `theta`.
//!
//! The following kernels are implemented:
//! * constant,
//! * white noise,
//! * squared exponential (RBF), isotropic or anisotropic (ARD),
//! * matern 3/2, isotropic or anisotropic (ARD),
//! * matern 5/2, isotropic or anisotropic (ARD),
//!
//! and kernels can be combined with `+` ([`SumKernel`]) and `*` ([`ProductKernel`]).
//!
//! ```
//! use surrogate_gp::kernels::{ConstantKernel, Kernel, SquaredExponentialKernel, WhiteKernel};
//!
//! let kernel = ConstantKernel::new(2.0).unwrap()
//!     * SquaredExponentialKernel::new(0.5).unwrap()
//!     + WhiteKernel::new(1e-6).unwrap();
//! assert_eq!(kernel.n_params(), 3);
//! ```

use crate::errors::{GpError, Result};
use crate::utils::scaled_sq_differences;
use ndarray::{s, Array1, Array2, Array3, ArrayBase, ArrayView1, Axis, Data, Ix2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Mul};

/// Default bounds (in linear space) of kernel hyperparameters
pub const DEFAULT_BOUNDS: (f64, f64) = (1e-5, 1e5);

/// A trait for covariance functions used in GP regression
pub trait Kernel: Clone + fmt::Debug + fmt::Display + Send + Sync {
    /// Number of free hyperparameters
    fn n_params(&self) -> usize;

    /// Hyperparameters on a natural-log scale
    fn theta(&self) -> Array1<f64>;

    /// Returns a copy of the kernel with the given log-scale hyperparameters
    fn with_theta(&self, theta: &ArrayView1<f64>) -> Result<Self>;

    /// Bounds of each hyperparameter on a natural-log scale
    fn bounds(&self) -> Vec<(f64, f64)>;

    /// Cross covariance `k(x1, x2)` as a (n1, n2) matrix
    fn value(
        &self,
        x1: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        x2: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> Array2<f64>;

    /// Covariance `k(x, x)` of a set of points with itself. Differs from
    /// `value(x, x)` only for kernels modelling observation noise.
    fn covariance(&self, x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Array2<f64> {
        self.value(x, x)
    }

    /// Diagonal of `covariance(x)`
    fn diag(&self, x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Array1<f64>;

    /// Covariance `k(x, x)` and its gradient with respect to `theta`
    /// as a (n, n, n_params) array
    fn value_with_gradient(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> (Array2<f64>, Array3<f64>);

    /// Checks the kernel can handle inputs of dimension `nx`
    fn check_input_dim(&self, _nx: usize) -> Result<()> {
        Ok(())
    }
}

fn check_theta_len(theta: &ArrayView1<f64>, expected: usize) -> Result<()> {
    if theta.len() != expected {
        return Err(GpError::InvalidValueError(format!(
            "Bad hyperparameters size: expected {}, got {}",
            expected,
            theta.len()
        )));
    }
    Ok(())
}

fn check_positive(name: &str, value: f64) -> Result<()> {
    if !(value.is_finite() && value > 0.) {
        return Err(GpError::KernelError(format!(
            "{name} should be positive and finite, got {value}"
        )));
    }
    Ok(())
}

fn check_bounds(lower: f64, upper: f64) -> Result<(f64, f64)> {
    check_positive("lower bound", lower)?;
    check_positive("upper bound", upper)?;
    if lower >= upper {
        return Err(GpError::KernelError(format!(
            "Bad bounds: lower {lower} should be less than upper {upper}"
        )));
    }
    Ok((lower, upper))
}

/// Constant kernel `k(x, x') = c`, usually used to scale another kernel
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct ConstantKernel {
    constant_value: f64,
    bounds: (f64, f64),
}

impl Default for ConstantKernel {
    fn default() -> Self {
        ConstantKernel {
            constant_value: 1.,
            bounds: DEFAULT_BOUNDS,
        }
    }
}

impl ConstantKernel {
    /// Constructor
    pub fn new(constant_value: f64) -> Result<Self> {
        check_positive("constant value", constant_value)?;
        Ok(ConstantKernel {
            constant_value,
            ..Default::default()
        })
    }

    /// Sets bounds of the constant value (linear space)
    pub fn with_bounds(mut self, lower: f64, upper: f64) -> Result<Self> {
        self.bounds = check_bounds(lower, upper)?;
        Ok(self)
    }

    /// Constant value
    pub fn constant_value(&self) -> f64 {
        self.constant_value
    }
}

impl Kernel for ConstantKernel {
    fn n_params(&self) -> usize {
        1
    }

    fn theta(&self) -> Array1<f64> {
        Array1::from_elem(1, self.constant_value.ln())
    }

    fn with_theta(&self, theta: &ArrayView1<f64>) -> Result<Self> {
        check_theta_len(theta, 1)?;
        Ok(ConstantKernel {
            constant_value: theta[0].exp(),
            bounds: self.bounds,
        })
    }

    fn bounds(&self) -> Vec<(f64, f64)> {
        vec![(self.bounds.0.ln(), self.bounds.1.ln())]
    }

    fn value(
        &self,
        x1: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        x2: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> Array2<f64> {
        Array2::from_elem((x1.nrows(), x2.nrows()), self.constant_value)
    }

    fn diag(&self, x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Array1<f64> {
        Array1::from_elem(x.nrows(), self.constant_value)
    }

    fn value_with_gradient(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> (Array2<f64>, Array3<f64>) {
        let n = x.nrows();
        let k = Array2::from_elem((n, n), self.constant_value);
        // d(c)/d(ln c) = c
        let grad = k.clone().insert_axis(Axis(2));
        (k, grad)
    }
}

impl fmt::Display for ConstantKernel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Constant({})", self.constant_value)
    }
}

/// White noise kernel `k(x, x') = noise_level` if `x == x'` else 0.
///
/// Noise is only added to the covariance of a set of points with itself,
/// cross covariances between distinct sets of points are zero.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct WhiteKernel {
    noise_level: f64,
    bounds: (f64, f64),
}

impl Default for WhiteKernel {
    fn default() -> Self {
        WhiteKernel {
            noise_level: 1.,
            bounds: DEFAULT_BOUNDS,
        }
    }
}

impl WhiteKernel {
    /// Constructor
    pub fn new(noise_level: f64) -> Result<Self> {
        check_positive("noise level", noise_level)?;
        Ok(WhiteKernel {
            noise_level,
            ..Default::default()
        })
    }

    /// Sets bounds of the noise level (linear space)
    pub fn with_bounds(mut self, lower: f64, upper: f64) -> Result<Self> {
        self.bounds = check_bounds(lower, upper)?;
        Ok(self)
    }

    /// Noise level (variance)
    pub fn noise_level(&self) -> f64 {
        self.noise_level
    }
}

impl Kernel for WhiteKernel {
    fn n_params(&self) -> usize {
        1
    }

    fn theta(&self) -> Array1<f64> {
        Array1::from_elem(1, self.noise_level.ln())
    }

    fn with_theta(&self, theta: &ArrayView1<f64>) -> Result<Self> {
        check_theta_len(theta, 1)?;
        Ok(WhiteKernel {
            noise_level: theta[0].exp(),
            bounds: self.bounds,
        })
    }

    fn bounds(&self) -> Vec<(f64, f64)> {
        vec![(self.bounds.0.ln(), self.bounds.1.ln())]
    }

    fn value(
        &self,
        x1: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        x2: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> Array2<f64> {
        Array2::zeros((x1.nrows(), x2.nrows()))
    }

    fn covariance(&self, x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Array2<f64> {
        Array2::eye(x.nrows()) * self.noise_level
    }

    fn diag(&self, x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Array1<f64> {
        Array1::from_elem(x.nrows(), self.noise_level)
    }

    fn value_with_gradient(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> (Array2<f64>, Array3<f64>) {
        let k = self.covariance(x);
        let grad = k.clone().insert_axis(Axis(2));
        (k, grad)
    }
}

impl fmt::Display for WhiteKernel {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "White({})", self.noise_level)
    }
}

/// Radial profile of a stationary kernel expressed with the squared scaled distance `r2`
pub trait RadialProfile: Clone + Copy + Default + fmt::Debug + Send + Sync {
    /// Profile name used for display
    const NAME: &'static str;

    /// Kernel value `k(r2)`
    fn value(r2: f64) -> f64;

    /// Factor `g(r2)` such that `dk/d(ln l_d) = g(r2) * s_d`
    /// where `s_d` is the squared scaled difference along dimension `d`
    fn gradient_factor(r2: f64) -> f64;
}

/// `exp(-r^2 / 2)`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct SquaredExponential;

impl RadialProfile for SquaredExponential {
    const NAME: &'static str = "SquaredExponential";

    fn value(r2: f64) -> f64 {
        (-0.5 * r2).exp()
    }

    fn gradient_factor(r2: f64) -> f64 {
        (-0.5 * r2).exp()
    }
}

/// `(1 + sqrt(3) r) exp(-sqrt(3) r)`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Matern32;

impl RadialProfile for Matern32 {
    const NAME: &'static str = "Matern32";

    fn value(r2: f64) -> f64 {
        let a = (3. * r2).sqrt();
        (1. + a) * (-a).exp()
    }

    fn gradient_factor(r2: f64) -> f64 {
        3. * (-(3. * r2).sqrt()).exp()
    }
}

/// `(1 + sqrt(5) r + 5/3 r^2) exp(-sqrt(5) r)`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct Matern52;

impl RadialProfile for Matern52 {
    const NAME: &'static str = "Matern52";

    fn value(r2: f64) -> f64 {
        let a = (5. * r2).sqrt();
        (1. + a + 5. / 3. * r2) * (-a).exp()
    }

    fn gradient_factor(r2: f64) -> f64 {
        let a = (5. * r2).sqrt();
        5. / 3. * (1. + a) * (-a).exp()
    }
}

/// Stationary kernel `k(x, x') = p(r)` where `r` is the distance between `x` and `x'`
/// scaled by length scales, `p` being a [`RadialProfile`].
///
/// With a single length scale the kernel is isotropic, otherwise there is one
/// length scale per input dimension (automatic relevance determination).
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct StationaryKernel<P: RadialProfile> {
    length_scale: Array1<f64>,
    bounds: (f64, f64),
    profile: P,
}

/// Squared exponential kernel (a.k.a. RBF)
pub type SquaredExponentialKernel = StationaryKernel<SquaredExponential>;
/// Matern 3/2 kernel
pub type Matern32Kernel = StationaryKernel<Matern32>;
/// Matern 5/2 kernel
pub type Matern52Kernel = StationaryKernel<Matern52>;

impl<P: RadialProfile> Default for StationaryKernel<P> {
    fn default() -> Self {
        StationaryKernel {
            length_scale: Array1::ones(1),
            bounds: DEFAULT_BOUNDS,
            profile: P::default(),
        }
    }
}

impl<P: RadialProfile> StationaryKernel<P> {
    /// Isotropic kernel constructor
    pub fn new(length_scale: f64) -> Result<Self> {
        Self::ard(Array1::from_elem(1, length_scale))
    }

    /// Anisotropic kernel constructor, one length scale per input dimension
    pub fn ard(length_scale: Array1<f64>) -> Result<Self> {
        if length_scale.is_empty() {
            return Err(GpError::KernelError(
                "At least one length scale is required".to_string(),
            ));
        }
        for l in length_scale.iter() {
            check_positive("length scale", *l)?;
        }
        Ok(StationaryKernel {
            length_scale,
            ..Default::default()
        })
    }

    /// Sets bounds of the length scales (linear space)
    pub fn with_bounds(mut self, lower: f64, upper: f64) -> Result<Self> {
        self.bounds = check_bounds(lower, upper)?;
        Ok(self)
    }

    /// Length scales
    pub fn length_scale(&self) -> &Array1<f64> {
        &self.length_scale
    }

    /// Whether there is one length scale per input dimension
    pub fn is_anisotropic(&self) -> bool {
        self.length_scale.len() > 1
    }
}

impl<P: RadialProfile> Kernel for StationaryKernel<P> {
    fn n_params(&self) -> usize {
        self.length_scale.len()
    }

    fn theta(&self) -> Array1<f64> {
        self.length_scale.mapv(f64::ln)
    }

    fn with_theta(&self, theta: &ArrayView1<f64>) -> Result<Self> {
        check_theta_len(theta, self.n_params())?;
        Ok(StationaryKernel {
            length_scale: theta.mapv(f64::exp),
            bounds: self.bounds,
            profile: self.profile,
        })
    }

    fn bounds(&self) -> Vec<(f64, f64)> {
        vec![(self.bounds.0.ln(), self.bounds.1.ln()); self.n_params()]
    }

    fn value(
        &self,
        x1: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        x2: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> Array2<f64> {
        scaled_sq_differences(x1, x2, &self.length_scale)
            .sum_axis(Axis(2))
            .mapv(P::value)
    }

    fn diag(&self, x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Array1<f64> {
        Array1::from_elem(x.nrows(), P::value(0.))
    }

    fn value_with_gradient(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> (Array2<f64>, Array3<f64>) {
        let sq = scaled_sq_differences(x, x, &self.length_scale);
        let r2 = sq.sum_axis(Axis(2));
        let k = r2.mapv(P::value);
        let factor = r2.mapv(P::gradient_factor);
        let grad = if self.is_anisotropic() {
            &sq * &factor.insert_axis(Axis(2))
        } else {
            (factor * &r2).insert_axis(Axis(2))
        };
        (k, grad)
    }

    fn check_input_dim(&self, nx: usize) -> Result<()> {
        if self.is_anisotropic() && self.length_scale.len() != nx {
            return Err(GpError::InvalidValueError(format!(
                "{} kernel has {} length scales but inputs have dimension {}",
                P::NAME,
                self.length_scale.len(),
                nx
            )));
        }
        Ok(())
    }
}

impl<P: RadialProfile> fmt::Display for StationaryKernel<P> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}(length_scale={})", P::NAME, self.length_scale)
    }
}

/// Sum of two kernels, hyperparameters of `a` come first in `theta`
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct SumKernel<A: Kernel, B: Kernel> {
    a: A,
    b: B,
}

/// Product of two kernels, hyperparameters of `a` come first in `theta`
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct ProductKernel<A: Kernel, B: Kernel> {
    a: A,
    b: B,
}

macro_rules! impl_composite_params {
    () => {
        fn n_params(&self) -> usize {
            self.a.n_params() + self.b.n_params()
        }

        fn theta(&self) -> Array1<f64> {
            let mut theta = self.a.theta().to_vec();
            theta.extend(self.b.theta().iter());
            Array1::from(theta)
        }

        fn with_theta(&self, theta: &ArrayView1<f64>) -> Result<Self> {
            check_theta_len(theta, self.n_params())?;
            let na = self.a.n_params();
            Ok(Self {
                a: self.a.with_theta(&theta.slice(s![..na]))?,
                b: self.b.with_theta(&theta.slice(s![na..]))?,
            })
        }

        fn bounds(&self) -> Vec<(f64, f64)> {
            let mut bounds = self.a.bounds();
            bounds.extend(self.b.bounds());
            bounds
        }

        fn check_input_dim(&self, nx: usize) -> Result<()> {
            self.a.check_input_dim(nx)?;
            self.b.check_input_dim(nx)
        }
    };
}

/// Stacks gradients along the last axis
fn stack_gradients(ga: &Array3<f64>, gb: &Array3<f64>) -> Array3<f64> {
    let (n1, n2, pa) = ga.dim();
    let pb = gb.dim().2;
    let mut grad = Array3::zeros((n1, n2, pa + pb));
    grad.slice_mut(s![.., .., ..pa]).assign(ga);
    grad.slice_mut(s![.., .., pa..]).assign(gb);
    grad
}

impl<A: Kernel, B: Kernel> SumKernel<A, B> {
    /// Constructor, same as `a + b`
    pub fn new(a: A, b: B) -> Self {
        SumKernel { a, b }
    }
}

impl<A: Kernel, B: Kernel> Kernel for SumKernel<A, B> {
    impl_composite_params!();

    fn value(
        &self,
        x1: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        x2: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> Array2<f64> {
        self.a.value(x1, x2) + self.b.value(x1, x2)
    }

    fn covariance(&self, x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Array2<f64> {
        self.a.covariance(x) + self.b.covariance(x)
    }

    fn diag(&self, x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Array1<f64> {
        self.a.diag(x) + self.b.diag(x)
    }

    fn value_with_gradient(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> (Array2<f64>, Array3<f64>) {
        let (ka, ga) = self.a.value_with_gradient(x);
        let (kb, gb) = self.b.value_with_gradient(x);
        (ka + kb, stack_gradients(&ga, &gb))
    }
}

impl<A: Kernel, B: Kernel> fmt::Display for SumKernel<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} + {}", self.a, self.b)
    }
}

impl<A: Kernel, B: Kernel> ProductKernel<A, B> {
    /// Constructor, same as `a * b`
    pub fn new(a: A, b: B) -> Self {
        ProductKernel { a, b }
    }
}

impl<A: Kernel, B: Kernel> Kernel for ProductKernel<A, B> {
    impl_composite_params!();

    fn value(
        &self,
        x1: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        x2: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> Array2<f64> {
        self.a.value(x1, x2) * self.b.value(x1, x2)
    }

    fn covariance(&self, x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Array2<f64> {
        self.a.covariance(x) * self.b.covariance(x)
    }

    fn diag(&self, x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Array1<f64> {
        self.a.diag(x) * self.b.diag(x)
    }

    fn value_with_gradient(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> (Array2<f64>, Array3<f64>) {
        let (ka, ga) = self.a.value_with_gradient(x);
        let (kb, gb) = self.b.value_with_gradient(x);
        let ga = &ga * &kb.view().insert_axis(Axis(2));
        let gb = &gb * &ka.view().insert_axis(Axis(2));
        (ka * kb, stack_gradients(&ga, &gb))
    }
}

impl<A: Kernel, B: Kernel> fmt::Display for ProductKernel<A, B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} * {}", self.a, self.b)
    }
}

macro_rules! impl_kernel_ops {
    ([$($generics:tt)*] $kernel:ty) => {
        impl<$($generics)* Rhs: Kernel> Add<Rhs> for $kernel {
            type Output = SumKernel<Self, Rhs>;

            fn add(self, rhs: Rhs) -> Self::Output {
                SumKernel::new(self, rhs)
            }
        }

        impl<$($generics)* Rhs: Kernel> Mul<Rhs> for $kernel {
            type Output = ProductKernel<Self, Rhs>;

            fn mul(self, rhs: Rhs) -> Self::Output {
                ProductKernel::new(self, rhs)
            }
        }
    };
}

impl_kernel_ops!([] ConstantKernel);
impl_kernel_ops!([] WhiteKernel);
impl_kernel_ops!([P: RadialProfile,] StationaryKernel<P>);
impl_kernel_ops!([A: Kernel, B: Kernel,] SumKernel<A, B>);
impl_kernel_ops!([A: Kernel, B: Kernel,] ProductKernel<A, B>);
