//! Covariance backends: given training data and kernel hyperparameters, build the
//! posterior state used for prediction, sampling and likelihood evaluation.
//!
//! [`CholeskyBackend`] is the dense implementation: the kernel matrix of the training
//! inputs is factorized with a Cholesky decomposition, the backend performs no
//! hyperparameter search of its own.

use crate::errors::{GpError, Result};
use crate::kernels::Kernel;
use crate::likelihood::MarginalLikelihood;
use crate::utils::pairwise_sq_distances;

use linfa_linalg::{cholesky::*, eigh::*, triangular::*};
use log::{debug, warn};
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, Axis, Data, Ix1, Ix2};
use ndarray_rand::rand::Rng;
use ndarray_rand::rand_distr::StandardNormal;
use ndarray_rand::RandomExt;
use ndarray_stats::QuantileExt;
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// 0.5 * ln(2 * pi)
const HALF_LN_2PI: f64 = 0.918_938_533_204_672_8;

/// Eigenvalues of the posterior covariance below this threshold are zeroed when sampling
const EIGEN_THRESHOLD: f64 = 1e-9;

/// A regression backend able to fit a GP posterior for given hyperparameters
pub trait CovarianceBackend: Clone + fmt::Debug + Send + Sync {
    /// Kernel type
    type Kernel: Kernel;
    /// Fitted state type
    type Fitted: FittedCovariance<Kernel = Self::Kernel>;

    /// Current kernel (holding the current hyperparameters)
    fn kernel(&self) -> &Self::Kernel;

    /// Updates current kernel hyperparameters
    fn set_theta(&mut self, theta: &ArrayView1<f64>) -> Result<()>;

    /// Checks backend configuration
    fn validate(&self) -> Result<()> {
        Ok(())
    }

    /// Fits the posterior on `(x, y)` with kernel hyperparameters `theta` (log scale)
    fn fit(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        y: &ArrayBase<impl Data<Elem = f64>, Ix1>,
        theta: &ArrayView1<f64>,
    ) -> Result<Self::Fitted>;
}

/// A fitted GP posterior, immutable once built
pub trait FittedCovariance: MarginalLikelihood + Clone + fmt::Debug + Send + Sync {
    /// Kernel type
    type Kernel: Kernel;

    /// Kernel set with the fitted hyperparameters
    fn kernel(&self) -> &Self::Kernel;

    /// Fitted hyperparameters (log scale)
    fn theta(&self) -> Array1<f64> {
        self.kernel().theta()
    }

    /// Input dimension of training data
    fn n_features(&self) -> usize;

    /// Log marginal likelihood at the fitted hyperparameters
    fn log_likelihood(&self) -> f64;

    /// Posterior mean and full covariance at `x`
    fn predict(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> Result<(Array1<f64>, Array2<f64>)>;

    /// Posterior mean and marginal variances at `x`
    fn predict_var(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> Result<(Array1<f64>, Array1<f64>)>;

    /// Draws `n_funcs` joint samples of the posterior at `x` as a (n_funcs, n) matrix
    fn sample<R: Rng + ?Sized>(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        n_funcs: usize,
        rng: &mut R,
    ) -> Result<Array2<f64>>;
}

/// Dense backend based on the Cholesky decomposition of the kernel matrix
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct CholeskyBackend<K: Kernel> {
    kernel: K,
    nugget: f64,
}

impl<K: Kernel> CholeskyBackend<K> {
    /// Constructor with no nugget, the noise being governed by the kernel
    pub fn new(kernel: K) -> Self {
        CholeskyBackend { kernel, nugget: 0. }
    }

    /// Sets the value added to the diagonal of the training kernel matrix
    pub fn nugget(mut self, nugget: f64) -> Self {
        self.nugget = nugget;
        self
    }

    /// Nugget value
    pub fn nugget_value(&self) -> f64 {
        self.nugget
    }
}

impl<K: Kernel> CovarianceBackend for CholeskyBackend<K> {
    type Kernel = K;
    type Fitted = CholeskyPosterior<K>;

    fn kernel(&self) -> &K {
        &self.kernel
    }

    fn set_theta(&mut self, theta: &ArrayView1<f64>) -> Result<()> {
        self.kernel = self.kernel.with_theta(theta)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if !(self.nugget.is_finite() && self.nugget >= 0.) {
            return Err(GpError::InvalidValueError(format!(
                "nugget should be non negative, got {}",
                self.nugget
            )));
        }
        Ok(())
    }

    fn fit(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        y: &ArrayBase<impl Data<Elem = f64>, Ix1>,
        theta: &ArrayView1<f64>,
    ) -> Result<CholeskyPosterior<K>> {
        if x.nrows() != y.len() {
            return Err(GpError::InvalidValueError(format!(
                "Training inputs and targets sizes mismatch: {} vs {}",
                x.nrows(),
                y.len()
            )));
        }
        warn_duplicates(x);
        let kernel = self.kernel.with_theta(theta)?;
        let y_train = y.to_owned();
        let kmat = add_nugget(kernel.covariance(x), self.nugget);
        let (l_chol, alpha, log_likelihood) = factorize(kmat, &y_train)?;
        if !log_likelihood.is_finite() {
            return Err(GpError::LikelihoodComputationError(format!(
                "Non finite log likelihood ({log_likelihood}) for theta = {theta}"
            )));
        }
        debug!("Cholesky fit: theta = {theta}, log likelihood = {log_likelihood}");
        Ok(CholeskyPosterior {
            kernel,
            nugget: self.nugget,
            x_train: x.to_owned(),
            y_train,
            l_chol,
            alpha,
            log_likelihood,
        })
    }
}

/// Posterior state of a [`CholeskyBackend`] fit
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct CholeskyPosterior<K: Kernel> {
    /// Kernel with the fitted hyperparameters
    kernel: K,
    /// Nugget used at fitting time
    nugget: f64,
    /// Training inputs (n, nx)
    x_train: Array2<f64>,
    /// Training targets (n,)
    y_train: Array1<f64>,
    /// Lower Cholesky factor of the training kernel matrix
    l_chol: Array2<f64>,
    /// Dual coefficients K^-1 y
    alpha: Array1<f64>,
    /// Log marginal likelihood at the fitted hyperparameters
    log_likelihood: f64,
}

impl<K: Kernel> CholeskyPosterior<K> {
    /// Dual coefficients `K^-1 y`
    pub fn alpha(&self) -> &Array1<f64> {
        &self.alpha
    }

    /// Training inputs
    pub fn x_train(&self) -> &Array2<f64> {
        &self.x_train
    }

    /// Cross covariance with training points (m, n) and `L^-1 k(x_train, x)` (n, m)
    fn cross_terms(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> Result<(Array2<f64>, Array2<f64>)> {
        let k_trans = self.kernel.value(x, &self.x_train);
        let v = self.l_chol.solve_triangular(&k_trans.t(), UPLO::Lower)?;
        Ok((k_trans, v))
    }
}

impl<K: Kernel> MarginalLikelihood for CholeskyPosterior<K> {
    fn log_marginal_likelihood(
        &self,
        theta: &ArrayView1<f64>,
        eval_gradient: bool,
    ) -> Result<(f64, Option<Array1<f64>>)> {
        let kernel = self.kernel.with_theta(theta)?;
        let (kmat, dk) = if eval_gradient {
            let (kmat, dk) = kernel.value_with_gradient(&self.x_train);
            (kmat, Some(dk))
        } else {
            (kernel.covariance(&self.x_train), None)
        };
        let kmat = add_nugget(kmat, self.nugget);

        let (l_chol, alpha, lml) = match factorize(kmat, &self.y_train) {
            Ok(res) => res,
            Err(err) => {
                debug!("Kernel matrix factorization failed for theta = {theta}: {err}");
                let grad = dk.map(|_| Array1::zeros(theta.len()));
                return Ok((f64::NEG_INFINITY, grad));
            }
        };

        let grad = match dk {
            Some(dk) => {
                let n = self.x_train.nrows();
                let l_inv = l_chol.solve_triangular(&Array2::eye(n), UPLO::Lower)?;
                let k_inv = l_inv.t().dot(&l_inv);
                let a = alpha.view().insert_axis(Axis(1));
                // 0.5 * tr((alpha alpha^T - K^-1) dK/dtheta_j)
                let tmp = a.dot(&a.t()) - k_inv;
                let grad = (0..dk.dim().2)
                    .map(|j| 0.5 * (&tmp * &dk.index_axis(Axis(2), j)).sum())
                    .collect::<Array1<f64>>();
                Some(grad)
            }
            None => None,
        };
        Ok((lml, grad))
    }
}

impl<K: Kernel> FittedCovariance for CholeskyPosterior<K> {
    type Kernel = K;

    fn kernel(&self) -> &K {
        &self.kernel
    }

    fn n_features(&self) -> usize {
        self.x_train.ncols()
    }

    fn log_likelihood(&self) -> f64 {
        self.log_likelihood
    }

    fn predict(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> Result<(Array1<f64>, Array2<f64>)> {
        let (k_trans, v) = self.cross_terms(x)?;
        let mean = k_trans.dot(&self.alpha);
        let cov = self.kernel.covariance(x) - v.t().dot(&v);
        Ok((mean, cov))
    }

    fn predict_var(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> Result<(Array1<f64>, Array1<f64>)> {
        let (k_trans, v) = self.cross_terms(x)?;
        let mean = k_trans.dot(&self.alpha);
        let var = self.kernel.diag(x) - v.mapv(|e| e * e).sum_axis(Axis(0));
        Ok((mean, var))
    }

    fn sample<R: Rng + ?Sized>(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        n_funcs: usize,
        rng: &mut R,
    ) -> Result<Array2<f64>> {
        let (mean, cov) = self.predict(x)?;
        let (v, w) = cov.eigh_into()?;
        let v = v.mapv(|e| {
            // Lower bound eigenvalues of the (possibly ill-conditioned) covariance
            if e < EIGEN_THRESHOLD {
                return 0.;
            }
            e.sqrt()
        });
        let c = w.dot(&Array2::from_diag(&v));
        let z = Array2::random_using((x.nrows(), n_funcs), StandardNormal, rng);
        let samples = mean.insert_axis(Axis(1)) + c.dot(&z);
        Ok(samples.reversed_axes())
    }
}

fn add_nugget(mut kmat: Array2<f64>, nugget: f64) -> Array2<f64> {
    if nugget > 0. {
        kmat.diag_mut().mapv_inplace(|v| v + nugget);
    }
    kmat
}

/// Returns the Cholesky factor L of `kmat`, `alpha = kmat^-1 y` and the log marginal likelihood
fn factorize(kmat: Array2<f64>, y: &Array1<f64>) -> Result<(Array2<f64>, Array1<f64>, f64)> {
    let n = y.len() as f64;
    let l_chol = kmat.cholesky()?;
    let ly = l_chol.solve_triangular(&y.view().insert_axis(Axis(1)), UPLO::Lower)?;
    let alpha = l_chol
        .t()
        .solve_triangular_into(ly, UPLO::Upper)?
        .index_axis_move(Axis(1), 0);
    let half_log_det = l_chol.diag().mapv(f64::ln).sum();
    let lml = -0.5 * y.dot(&alpha) - half_log_det - n * HALF_LN_2PI;
    Ok((l_chol, alpha, lml))
}

fn warn_duplicates(x: &ArrayBase<impl Data<Elem = f64>, Ix2>) {
    let mut d2 = pairwise_sq_distances(x);
    d2.diag_mut().fill(f64::INFINITY);
    if let Ok(min) = d2.min() {
        if *min == 0. {
            warn!("Duplicated points found in training data, kernel matrix may be singular");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(feature = "serializable")]
    use crate::kernels::ProductKernel;
    use crate::kernels::{ConstantKernel, SquaredExponentialKernel, WhiteKernel};
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use ndarray::{array, Array};
    use rand_xoshiro::rand_core::SeedableRng;
    use rand_xoshiro::Xoshiro256Plus;

    fn training_data() -> (Array2<f64>, Array1<f64>) {
        let x = array![[0.], [0.7], [1.5], [2.3], [3.1], [4.0]];
        let y = x.column(0).mapv(|v: f64| v.sin() + 0.1 * v);
        (x, y)
    }

    #[test]
    fn test_lml_single_point() {
        // K = [c], lml = -0.5 y^2 / c - 0.5 ln c - 0.5 ln(2 pi)
        let backend = CholeskyBackend::new(ConstantKernel::new(2.).unwrap());
        let fitted = backend
            .fit(&array![[0.]], &array![1.5], &backend.kernel().theta().view())
            .unwrap();
        let expected = -0.5 * 1.5 * 1.5 / 2. - 0.5 * 2f64.ln() - HALF_LN_2PI;
        assert_abs_diff_eq!(fitted.log_likelihood(), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_interpolation() {
        let (x, y) = training_data();
        let backend = CholeskyBackend::new(SquaredExponentialKernel::new(0.8).unwrap()).nugget(1e-10);
        let fitted = backend.fit(&x, &y, &backend.kernel().theta().view()).unwrap();
        let (mean, var) = fitted.predict_var(&x).unwrap();
        assert_abs_diff_eq!(mean, y, epsilon = 1e-5);
        assert_abs_diff_eq!(var, Array1::zeros(x.nrows()), epsilon = 1e-5);
        let (mean2, cov) = fitted.predict(&x).unwrap();
        assert_abs_diff_eq!(mean, mean2, epsilon = 1e-12);
        assert_abs_diff_eq!(cov.diag(), var, epsilon = 1e-12);

        assert_eq!(fitted.x_train(), &x);
        let kmat = add_nugget(fitted.kernel().covariance(&x), 1e-10);
        assert_abs_diff_eq!(kmat.dot(fitted.alpha()), y, epsilon = 1e-8);
    }

    #[test]
    fn test_lml_gradient() {
        let (x, y) = training_data();
        let kernel = ConstantKernel::new(1.3).unwrap()
            * SquaredExponentialKernel::new(0.8).unwrap()
            + WhiteKernel::new(1e-2).unwrap();
        let backend = CholeskyBackend::new(kernel);
        let fitted = backend.fit(&x, &y, &backend.kernel().theta().view()).unwrap();
        let theta = array![0.1, -0.4, -3.];
        let (lml, grad) = fitted.log_marginal_likelihood(&theta.view(), true).unwrap();
        let (lml2, none) = fitted.log_marginal_likelihood(&theta.view(), false).unwrap();
        assert_abs_diff_eq!(lml, lml2, epsilon = 1e-12);
        assert!(none.is_none());

        let f = |t: &Vec<f64>| {
            let t = Array::from(t.clone());
            fitted.log_marginal_likelihood(&t.view(), false).unwrap().0
        };
        let fdiff = theta.to_vec().central_diff(&f);
        assert_abs_diff_eq!(grad.unwrap(), Array::from(fdiff), epsilon = 1e-5);
        // fitted state is untouched
        assert_abs_diff_eq!(fitted.theta(), backend.kernel().theta(), epsilon = 1e-15);
    }

    #[test]
    fn test_singular_kernel_matrix() {
        // duplicated points without noise
        let x = array![[0.], [0.], [1.]];
        let y = array![1., 1., 2.];
        let backend = CholeskyBackend::new(ConstantKernel::new(1.).unwrap());
        let res = backend.fit(&x, &y, &backend.kernel().theta().view());
        assert!(matches!(res, Err(GpError::LinalgError(_))));
    }

    #[test]
    fn test_factorization_failure_in_lml() {
        let (x, y) = training_data();
        let backend = CholeskyBackend::new(ConstantKernel::new(1.).unwrap() + WhiteKernel::new(1.).unwrap());
        let fitted = backend.fit(&x, &y, &backend.kernel().theta().view()).unwrap();
        // constant kernel with vanishing noise: rank one kernel matrix
        let (lml, grad) = fitted
            .log_marginal_likelihood(&array![0., -800.].view(), true)
            .unwrap();
        assert_eq!(lml, f64::NEG_INFINITY);
        assert_abs_diff_eq!(grad.unwrap(), array![0., 0.]);
    }

    #[test]
    fn test_sample_shape_and_mean() {
        let (x, y) = training_data();
        let backend = CholeskyBackend::new(SquaredExponentialKernel::new(0.8).unwrap()).nugget(1e-10);
        let fitted = backend.fit(&x, &y, &backend.kernel().theta().view()).unwrap();
        let xtest = array![[0.3], [1.1], [2.7]];
        let mut rng = Xoshiro256Plus::seed_from_u64(0);
        let samples = fitted.sample(&xtest, 2000, &mut rng).unwrap();
        assert_eq!(samples.dim(), (2000, 3));
        let (mean, _) = fitted.predict_var(&xtest).unwrap();
        assert_abs_diff_eq!(samples.mean_axis(Axis(0)).unwrap(), mean, epsilon = 0.05);
    }

    #[test]
    fn test_nugget_validation() {
        let backend = CholeskyBackend::new(ConstantKernel::default()).nugget(-1.);
        assert!(backend.validate().is_err());
        assert!(CholeskyBackend::new(ConstantKernel::default()).validate().is_ok());
    }

    #[cfg(feature = "serializable")]
    #[test]
    fn test_posterior_serde() {
        let (x, y) = training_data();
        let backend = CholeskyBackend::new(
            ConstantKernel::new(1.3).unwrap() * SquaredExponentialKernel::new(0.8).unwrap(),
        )
        .nugget(1e-10);
        let fitted = backend.fit(&x, &y, &backend.kernel().theta().view()).unwrap();
        let json = serde_json::to_string(&fitted).unwrap();
        let loaded: CholeskyPosterior<ProductKernel<ConstantKernel, SquaredExponentialKernel>> =
            serde_json::from_str(&json).unwrap();
        let xtest = array![[0.3], [1.1], [2.7]];
        let (mean, var) = fitted.predict_var(&xtest).unwrap();
        let (mean2, var2) = loaded.predict_var(&xtest).unwrap();
        assert_abs_diff_eq!(mean, mean2, epsilon = 1e-12);
        assert_abs_diff_eq!(var, var2, epsilon = 1e-12);
    }
}
