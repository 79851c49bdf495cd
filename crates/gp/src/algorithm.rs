use crate::backend::{CholeskyBackend, CovarianceBackend, FittedCovariance};
use crate::errors::{GpError, Result};
use crate::kernels::Kernel;
use crate::likelihood::NegLogLikelihood;
use crate::optimization::{optimize_theta, OptimParams};
use crate::parameters::{GpParams, GpValidParams};
use crate::utils::OutputNormalizer;
use crate::VERY_SMALL_NUMBER;

use linfa::prelude::{DatasetBase, Fit, PredictInplace};
use log::{debug, error, info};
use ndarray::{Array1, Array2, ArrayBase, ArrayView1, Data, Ix1, Ix2};
use ndarray_rand::rand::Rng;
use rand_xoshiro::rand_core::SeedableRng;
use rand_xoshiro::Xoshiro256Plus;
use std::fmt;
use std::time::Instant;

/// Fitted state of a trained model, replaced as a whole on each successful training
#[derive(Clone, Debug)]
struct TrainedState<P> {
    fitted: P,
    normalizer: Option<OutputNormalizer>,
}

/// Gaussian Process surrogate model
///
/// The model targets optimization loops where an expensive black-box function `f`
/// is observed at a few points: it predicts posterior means and variances of `f` at new
/// points and draws joint samples of the posterior.
///
/// It is parameterized by a covariance backend `B` (the default one being
/// [`CholeskyBackend`]) holding a [`Kernel`] whose hyperparameters `theta` are
/// handled on a natural-log scale.
///
/// # Training
///
/// Given `n` observations `(x, y)`, targets are optionally normalized to zero mean and
/// unit variance, then the kernel hyperparameters are fitted by minimizing the negative
/// log marginal likelihood
///
/// ```text
/// -log p(y | x, theta) = 1/2 y^T K^-1 y + 1/2 log|K| + n/2 log(2 pi)
/// ```
///
/// optionally penalized by a hyperparameter prior, using a bounded optimizer started
/// from the current kernel hyperparameters.
///
/// # Prediction
///
/// Posterior mean and variances are returned on the original output scale. Marginal
/// variances are lower bounded by [`VERY_SMALL_NUMBER`].
///
/// # Example
///
/// ```no_run
/// use surrogate_gp::{CholeskyBackend, GpParams};
/// use surrogate_gp::kernels::{ConstantKernel, SquaredExponentialKernel};
/// use ndarray::{array, Array, Axis};
///
/// let xt = array![[0.0], [1.0], [2.0], [3.0], [4.0]];
/// let yt = xt.column(0).mapv(|v: f64| v.sin());
///
/// let kernel = ConstantKernel::default() * SquaredExponentialKernel::default();
/// let backend = CholeskyBackend::new(kernel).nugget(1e-10);
/// let mut gp = GpParams::new(backend).build().expect("valid parameters");
/// gp.train(&xt, &yt, true).expect("GP trained");
///
/// let xtest = Array::linspace(0., 4., 20).insert_axis(Axis(1));
/// let (mean, var) = gp.predict_valvar(&xtest).expect("GP prediction");
/// let samples = gp.sample_functions(&xtest, 5).expect("GP sampling");
/// assert_eq!(samples.dim(), (5, 20));
/// ```
///
/// # Reference
///
/// Rasmussen, C. E., & Williams, C. K. I. (2006). Gaussian Processes for Machine Learning.
/// MIT Press. (Algorithm 2.1 and eq. 5.9)
#[derive(Clone, Debug)]
pub struct GaussianProcess<B: CovarianceBackend> {
    /// Parameters the model was built with
    params: GpValidParams<B>,
    /// Backend holding the current kernel hyperparameters
    backend: B,
    /// Fitted state, `None` until a training succeeds
    state: Option<TrainedState<B::Fitted>>,
    /// Random generator used by `sample_functions`
    rng: Xoshiro256Plus,
}

/// GP surrogate using the dense Cholesky backend
pub type Gp<K> = GaussianProcess<CholeskyBackend<K>>;

impl<B: CovarianceBackend> GaussianProcess<B> {
    /// Gp parameters constructor
    pub fn params(backend: B) -> GpParams<B> {
        GpParams::new(backend)
    }

    /// Untrained model built from validated parameters
    pub fn new(params: GpValidParams<B>) -> Self {
        let backend = params.backend.clone();
        let rng = Xoshiro256Plus::seed_from_u64(params.seed);
        GaussianProcess {
            params,
            backend,
            state: None,
            rng,
        }
    }

    /// Trains the model on `(x, y)`, `x` being a (n, nx) matrix and `y` a vector of size n.
    ///
    /// When `optimize` is true, kernel hyperparameters are fitted starting from the current ones,
    /// otherwise current hyperparameters are used as is. On error the model (trained state
    /// and kernel hyperparameters) is left untouched.
    pub fn train(
        &mut self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        y: &ArrayBase<impl Data<Elem = f64>, Ix1>,
        optimize: bool,
    ) -> Result<()> {
        if x.nrows() == 0 {
            return Err(GpError::InvalidValueError(
                "At least one training point is required".to_string(),
            ));
        }
        if x.nrows() != y.len() {
            return Err(GpError::InvalidValueError(format!(
                "Training inputs ({}) and targets ({}) sizes mismatch",
                x.nrows(),
                y.len()
            )));
        }
        self.backend.kernel().check_input_dim(x.ncols())?;
        let theta0 = self.backend.kernel().theta();
        if let Some(d) = self.params.prior.as_ref().and_then(|p| p.dim()) {
            if d != theta0.len() {
                return Err(GpError::InvalidValueError(format!(
                    "Prior dimension ({}) should match the number of kernel hyperparameters ({})",
                    d,
                    theta0.len()
                )));
            }
        }

        let now = Instant::now();
        let (normalizer, yt) = if self.params.normalize_y {
            let normalizer = OutputNormalizer::new(y);
            let yt = normalizer.transform(y);
            (Some(normalizer), yt)
        } else {
            (None, y.to_owned())
        };

        let fitted = self.backend.fit(x, &yt, &theta0.view())?;
        let theta = if optimize {
            self.optimize_hyperparameters(&fitted)
        } else {
            fitted.theta()
        };
        let fitted = self.backend.fit(x, &yt, &theta.view())?;
        self.backend.set_theta(&theta.view())?;

        info!(
            "GP trained on {} points in {:?}ms: kernel = {}, log likelihood = {}",
            x.nrows(),
            now.elapsed().as_millis(),
            fitted.kernel(),
            fitted.log_likelihood()
        );
        self.state = Some(TrainedState { fitted, normalizer });
        Ok(())
    }

    /// Minimizes the negative log marginal likelihood from the fitted hyperparameters
    fn optimize_hyperparameters(&self, fitted: &B::Fitted) -> Array1<f64> {
        let nll = NegLogLikelihood::new(fitted, self.params.prior.as_deref());
        let objfn = |x: &[f64], gradient: Option<&mut [f64]>, _params: &mut ()| -> f64 {
            let (value, grad) = nll.evaluate(&ArrayView1::from(x));
            if let Some(gradient) = gradient {
                gradient
                    .iter_mut()
                    .zip(grad.iter())
                    .for_each(|(g, v)| *g = *v);
            }
            value
        };

        let bounds = self
            .params
            .bounds_convention
            .optimizer_bounds(&fitted.kernel().bounds());
        let optim_params = OptimParams {
            max_eval: self.params.max_eval,
            ftol_rel: self.params.ftol_rel,
            ftol_abs: self.params.ftol_abs,
            ..OptimParams::default()
        };
        let now = Instant::now();
        let (fmin, theta) = optimize_theta(
            objfn,
            &fitted.theta(),
            &bounds,
            self.params.optimizer,
            &optim_params,
        );
        debug!(
            "elapsed optim = {:?}ms, nll = {}, theta = {}",
            now.elapsed().as_millis(),
            fmin,
            theta
        );
        theta
    }

    fn trained_state(&self) -> Result<&TrainedState<B::Fitted>> {
        self.state.as_ref().ok_or(GpError::NotTrained)
    }

    fn check_input(
        state: &TrainedState<B::Fitted>,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> Result<()> {
        let nx = state.fitted.n_features();
        if x.ncols() != nx {
            return Err(GpError::InvalidValueError(format!(
                "Input dimension ({}) should match training dimension ({})",
                x.ncols(),
                nx
            )));
        }
        Ok(())
    }

    /// Predict posterior mean and marginal variances at `n` points `x` given as a (n, nx) matrix.
    ///
    /// Variances are lower bounded by [`VERY_SMALL_NUMBER`].
    pub fn predict_valvar(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> Result<(Array1<f64>, Array1<f64>)> {
        let state = self.trained_state()?;
        Self::check_input(state, x)?;
        let (mean, var) = state.fitted.predict_var(x)?;
        let (mean, var) = match &state.normalizer {
            Some(normalizer) => (
                normalizer.untransform(&mean),
                normalizer.untransform_var(&var),
            ),
            None => (mean, var),
        };
        let var = var.mapv(|v| v.max(VERY_SMALL_NUMBER));
        Ok((mean, var))
    }

    /// Predict posterior mean and full covariance at `n` points `x` given as a (n, nx) matrix.
    ///
    /// The diagonal of the covariance is lower bounded by [`VERY_SMALL_NUMBER`].
    pub fn predict_valcov(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> Result<(Array1<f64>, Array2<f64>)> {
        let state = self.trained_state()?;
        Self::check_input(state, x)?;
        let (mean, cov) = state.fitted.predict(x)?;
        let (mean, mut cov) = match &state.normalizer {
            Some(normalizer) => (
                normalizer.untransform(&mean),
                normalizer.untransform_cov(&cov),
            ),
            None => (mean, cov),
        };
        cov.diag_mut()
            .mapv_inplace(|v| v.max(VERY_SMALL_NUMBER));
        Ok((mean, cov))
    }

    /// Predict posterior mean at `n` points `x` given as a (n, nx) matrix.
    pub fn predict(&self, x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Result<Array1<f64>> {
        Ok(self.predict_valvar(x)?.0)
    }

    /// Predict marginal variances at `n` points `x` given as a (n, nx) matrix.
    pub fn predict_var(&self, x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Result<Array1<f64>> {
        Ok(self.predict_valvar(x)?.1)
    }

    /// Draws `n_funcs` joint posterior samples at `n` points `x` using the model random generator.
    ///
    /// Returns a (n_funcs, n) matrix on the original output scale.
    pub fn sample_functions(
        &mut self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        n_funcs: usize,
    ) -> Result<Array2<f64>> {
        let state = self.state.as_ref().ok_or(GpError::NotTrained)?;
        Self::sample_state(state, x, n_funcs, &mut self.rng)
    }

    /// Draws `n_funcs` joint posterior samples at `n` points `x` using the given random generator.
    pub fn sample_functions_with_rng<R: Rng + ?Sized>(
        &self,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        n_funcs: usize,
        rng: &mut R,
    ) -> Result<Array2<f64>> {
        Self::sample_state(self.trained_state()?, x, n_funcs, rng)
    }

    fn sample_state<R: Rng + ?Sized>(
        state: &TrainedState<B::Fitted>,
        x: &ArrayBase<impl Data<Elem = f64>, Ix2>,
        n_funcs: usize,
        rng: &mut R,
    ) -> Result<Array2<f64>> {
        Self::check_input(state, x)?;
        let samples = state.fitted.sample(x, n_funcs, rng)?;
        Ok(match &state.normalizer {
            Some(normalizer) => normalizer.untransform_samples(&samples),
            None => samples,
        })
    }

    /// Whether a training succeeded
    pub fn is_trained(&self) -> bool {
        self.state.is_some()
    }

    /// Kernel hyperparameters (log scale)
    pub fn theta(&self) -> Array1<f64> {
        match &self.state {
            Some(state) => state.fitted.theta(),
            None => self.backend.kernel().theta(),
        }
    }

    /// Kernel holding the current hyperparameters
    pub fn kernel(&self) -> &B::Kernel {
        self.backend.kernel()
    }

    /// Log marginal likelihood of the trained model
    pub fn log_marginal_likelihood(&self) -> Result<f64> {
        Ok(self.trained_state()?.fitted.log_likelihood())
    }

    /// Target normalization of the trained model if any
    pub fn normalizer(&self) -> Option<&OutputNormalizer> {
        self.state.as_ref().and_then(|s| s.normalizer.as_ref())
    }

    /// Fitted backend state of the trained model
    pub fn fitted(&self) -> Option<&B::Fitted> {
        self.state.as_ref().map(|s| &s.fitted)
    }

    /// Retrieve input and output dimensions
    pub fn dims(&self) -> Option<(usize, usize)> {
        self.state.as_ref().map(|s| (s.fitted.n_features(), 1))
    }

    /// Parameters the model was built with
    pub fn gp_params(&self) -> &GpValidParams<B> {
        &self.params
    }

    /// Returns a variance predictor adaptor for linfa `predict`
    pub fn variance_predictor(&self) -> GpVariancePredictor<'_, B> {
        GpVariancePredictor(self)
    }
}

impl<B: CovarianceBackend> fmt::Display for GaussianProcess<B> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.state {
            Some(state) => write!(
                f,
                "GP(kernel={}, theta={}, likelihood={})",
                state.fitted.kernel(),
                state.fitted.theta(),
                state.fitted.log_likelihood()
            ),
            None => write!(f, "GP(kernel={}, untrained)", self.backend.kernel()),
        }
    }
}

impl<B: CovarianceBackend, D: Data<Elem = f64>> Fit<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>, GpError>
    for GpValidParams<B>
{
    type Object = GaussianProcess<B>;

    /// Fit GP parameters using maximum likelihood
    fn fit(
        &self,
        dataset: &DatasetBase<ArrayBase<D, Ix2>, ArrayBase<D, Ix1>>,
    ) -> Result<Self::Object> {
        let mut gp = GaussianProcess::new(self.clone());
        gp.train(dataset.records(), dataset.targets(), self.optimize)?;
        Ok(gp)
    }
}

impl<B, D> PredictInplace<ArrayBase<D, Ix2>, Array1<f64>> for GaussianProcess<B>
where
    B: CovarianceBackend,
    D: Data<Elem = f64>,
{
    fn predict_inplace(&self, x: &ArrayBase<D, Ix2>, y: &mut Array1<f64>) {
        assert_eq!(
            x.nrows(),
            y.len(),
            "The number of data points must match the number of output targets."
        );
        match self.predict(x) {
            Ok(pred) => y.assign(&pred),
            Err(err) => {
                error!("GP prediction failed: {err}");
                y.fill(f64::NAN);
            }
        }
    }

    fn default_target(&self, x: &ArrayBase<D, Ix2>) -> Array1<f64> {
        Array1::zeros(x.nrows())
    }
}

/// Adaptor for variance prediction of a GP model using linfa `predict`
pub struct GpVariancePredictor<'a, B: CovarianceBackend>(&'a GaussianProcess<B>);

impl<B, D> PredictInplace<ArrayBase<D, Ix2>, Array1<f64>> for GpVariancePredictor<'_, B>
where
    B: CovarianceBackend,
    D: Data<Elem = f64>,
{
    fn predict_inplace(&self, x: &ArrayBase<D, Ix2>, y: &mut Array1<f64>) {
        assert_eq!(
            x.nrows(),
            y.len(),
            "The number of data points must match the number of output targets."
        );
        match self.0.predict_var(x) {
            Ok(var) => y.assign(&var),
            Err(err) => {
                error!("GP variance prediction failed: {err}");
                y.fill(f64::NAN);
            }
        }
    }

    fn default_target(&self, x: &ArrayBase<D, Ix2>) -> Array1<f64> {
        Array1::zeros(x.nrows())
    }
}
