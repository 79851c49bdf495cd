use crate::backend::{CholeskyBackend, CovarianceBackend};
use crate::errors::{GpError, Result};
use crate::kernels::Kernel;
use crate::optimization::{BoundsConvention, ThetaOptimizer};
use crate::priors::Prior;
use crate::{GaussianProcess, GP_DEFAULT_SEED, GP_FTOL_REL, GP_MAX_EVAL, GP_MIN_EVAL};
use linfa::ParamGuard;
use std::sync::Arc;

/// A set of validated GP parameters.
#[derive(Clone, Debug)]
pub struct GpValidParams<B: CovarianceBackend> {
    /// Covariance backend holding the kernel and its initial hyperparameters
    pub(crate) backend: B,
    /// Whether targets are normalized to zero mean and unit variance before fitting
    pub(crate) normalize_y: bool,
    /// Whether hyperparameters are optimized when fitting through linfa
    pub(crate) optimize: bool,
    /// Optional prior over log-scale hyperparameters
    pub(crate) prior: Option<Arc<dyn Prior>>,
    /// Bounds handling during hyperparameters optimization
    pub(crate) bounds_convention: BoundsConvention,
    /// Hyperparameters optimizer
    pub(crate) optimizer: ThetaOptimizer,
    /// Max number of likelihood evaluations during optimization
    pub(crate) max_eval: usize,
    /// Relative tolerance on the objective
    pub(crate) ftol_rel: f64,
    /// Absolute tolerance on the objective
    pub(crate) ftol_abs: f64,
    /// Seed of the random generator used for sampling
    pub(crate) seed: u64,
}

impl<B: CovarianceBackend> GpValidParams<B> {
    fn with_backend(backend: B) -> Self {
        GpValidParams {
            backend,
            normalize_y: true,
            optimize: true,
            prior: None,
            bounds_convention: BoundsConvention::default(),
            optimizer: ThetaOptimizer::default(),
            max_eval: GP_MAX_EVAL,
            ftol_rel: GP_FTOL_REL,
            ftol_abs: 0.,
            seed: GP_DEFAULT_SEED,
        }
    }

    /// Get covariance backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Whether targets are normalized
    pub fn normalize_y(&self) -> bool {
        self.normalize_y
    }

    /// Whether hyperparameters are optimized when fitting a linfa dataset
    pub fn optimize(&self) -> bool {
        self.optimize
    }

    /// Get hyperparameters prior if any
    pub fn prior(&self) -> Option<&dyn Prior> {
        self.prior.as_deref()
    }

    /// Get bounds handling during optimization
    pub fn bounds_convention(&self) -> BoundsConvention {
        self.bounds_convention
    }

    /// Get hyperparameters optimizer
    pub fn optimizer(&self) -> ThetaOptimizer {
        self.optimizer
    }

    /// Get the max number of likelihood evaluations during one optimization
    pub fn max_eval(&self) -> usize {
        self.max_eval
    }

    /// Get relative tolerance on the objective
    pub fn ftol_rel(&self) -> f64 {
        self.ftol_rel
    }

    /// Get absolute tolerance on the objective
    pub fn ftol_abs(&self) -> f64 {
        self.ftol_abs
    }

    /// Get sampling random generator seed
    pub fn seed(&self) -> u64 {
        self.seed
    }
}

#[derive(Clone, Debug)]
/// The set of hyperparameters that can be specified for the execution of
/// the [GP algorithm](struct.GaussianProcess.html).
pub struct GpParams<B: CovarianceBackend>(GpValidParams<B>);

impl<B: CovarianceBackend> GpParams<B> {
    /// A constructor for GP parameters given a covariance backend
    pub fn new(backend: B) -> GpParams<B> {
        Self(GpValidParams::with_backend(backend))
    }

    /// A constructor for GP parameters from validated parameters
    pub fn new_from_valid(params: &GpValidParams<B>) -> Self {
        Self(params.clone())
    }

    /// Set covariance backend
    pub fn backend(mut self, backend: B) -> Self {
        self.0.backend = backend;
        self
    }

    /// Set whether targets are normalized (default true)
    pub fn normalize_y(mut self, normalize_y: bool) -> Self {
        self.0.normalize_y = normalize_y;
        self
    }

    /// Set whether hyperparameters are optimized when fitting a linfa dataset (default true)
    pub fn optimize(mut self, optimize: bool) -> Self {
        self.0.optimize = optimize;
        self
    }

    /// Set prior over log-scale hyperparameters
    pub fn prior(mut self, prior: impl Prior + 'static) -> Self {
        self.0.prior = Some(Arc::new(prior));
        self
    }

    /// Set a shared prior over log-scale hyperparameters
    pub fn shared_prior(mut self, prior: Option<Arc<dyn Prior>>) -> Self {
        self.0.prior = prior;
        self
    }

    /// Set bounds handling during optimization (default [BoundsConvention::Exponentiated])
    pub fn bounds_convention(mut self, bounds_convention: BoundsConvention) -> Self {
        self.0.bounds_convention = bounds_convention;
        self
    }

    /// Set hyperparameters optimizer (default [ThetaOptimizer::Slsqp])
    pub fn optimizer(mut self, optimizer: ThetaOptimizer) -> Self {
        self.0.optimizer = optimizer;
        self
    }

    /// Set the max number of likelihood evaluations during one optimization
    /// Given max_eval is raised to [crate::GP_MIN_EVAL] when smaller.
    pub fn max_eval(mut self, max_eval: usize) -> Self {
        self.0.max_eval = GP_MIN_EVAL.max(max_eval);
        self
    }

    /// Set relative tolerance on the objective
    pub fn ftol_rel(mut self, ftol_rel: f64) -> Self {
        self.0.ftol_rel = ftol_rel;
        self
    }

    /// Set absolute tolerance on the objective
    pub fn ftol_abs(mut self, ftol_abs: f64) -> Self {
        self.0.ftol_abs = ftol_abs;
        self
    }

    /// Set the seed of the random generator used by `sample_functions`
    pub fn seed(mut self, seed: u64) -> Self {
        self.0.seed = seed;
        self
    }

    /// Checks parameters and builds an untrained model
    pub fn build(self) -> Result<GaussianProcess<B>> {
        Ok(GaussianProcess::new(self.check()?))
    }
}

impl<K: Kernel> GpParams<CholeskyBackend<K>> {
    /// A constructor for GP parameters using the dense Cholesky backend with given kernel
    pub fn from_kernel(kernel: K) -> Self {
        Self::new(CholeskyBackend::new(kernel))
    }
}

impl<B: CovarianceBackend> From<GpValidParams<B>> for GpParams<B> {
    fn from(valid: GpValidParams<B>) -> Self {
        GpParams(valid)
    }
}

impl<B: CovarianceBackend> ParamGuard for GpParams<B> {
    type Checked = GpValidParams<B>;
    type Error = GpError;

    fn check_ref(&self) -> Result<&Self::Checked> {
        self.0.backend.validate()?;
        if !(self.0.ftol_rel.is_finite() && self.0.ftol_rel >= 0.) {
            return Err(GpError::InvalidValueError(format!(
                "`ftol_rel` should be non negative, got {}",
                self.0.ftol_rel
            )));
        }
        if !(self.0.ftol_abs.is_finite() && self.0.ftol_abs >= 0.) {
            return Err(GpError::InvalidValueError(format!(
                "`ftol_abs` should be non negative, got {}",
                self.0.ftol_abs
            )));
        }
        if let Some(d) = self.0.prior.as_ref().and_then(|p| p.dim()) {
            let n_params = self.0.backend.kernel().n_params();
            if d != n_params {
                return Err(GpError::InvalidValueError(format!(
                    "Prior dimension ({d}) should match the number of kernel hyperparameters ({n_params})"
                )));
            }
        }
        Ok(&self.0)
    }

    fn check(self) -> Result<Self::Checked> {
        self.check_ref()?;
        Ok(self.0)
    }
}
