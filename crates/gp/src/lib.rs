//! This library implements a [Gaussian Process](https://en.wikipedia.org/wiki/Gaussian_process)
//! regression surrogate model dedicated to model-based (bayesian) optimization loops.
//!
//! Given a few noisy observations of an expensive black-box function, the surrogate fits
//! kernel hyperparameters by maximizing the marginal likelihood (optionally with a
//! hyperparameter prior), predicts posterior means and variances at new points and draws
//! joint posterior samples used by acquisition functions.
//!
//! The surrogate is implemented by [GaussianProcess] parameterized by [GpParams].
//! Covariance functions are defined in the [kernels] module, hyperparameter priors in the
//! [priors] module, the dense Cholesky regression backend is [CholeskyBackend].
#![warn(missing_docs)]
#![warn(rustdoc::broken_intra_doc_links)]
mod algorithm;
mod backend;
mod errors;
pub mod kernels;
mod likelihood;
pub mod priors;

mod parameters;
mod utils;

mod optimization;

pub use algorithm::*;
pub use backend::*;
pub use errors::*;
pub use likelihood::*;
pub use optimization::{BoundsConvention, ThetaOptimizer};
pub use parameters::*;
pub use utils::OutputNormalizer;

/// Lower bound of predicted variances
pub const VERY_SMALL_NUMBER: f64 = 1e-10;

/// Default max number of likelihood evaluations during hyperparameters optimization
pub const GP_MAX_EVAL: usize = 200;
/// Min number of likelihood evaluations during hyperparameters optimization
pub const GP_MIN_EVAL: usize = 10;
/// Default relative tolerance on the objective during hyperparameters optimization
pub const GP_FTOL_REL: f64 = 1e-8;
/// Default seed of the random generator used for posterior sampling
pub const GP_DEFAULT_SEED: u64 = 42;
