use thiserror::Error;

/// A result type for GP surrogate algorithms
pub type Result<T> = std::result::Result<T, GpError>;

/// An error when using a [`GaussianProcess`](crate::GaussianProcess) surrogate
#[derive(Error, Debug)]
pub enum GpError {
    /// When prediction or sampling is requested before a successful training
    #[error("Model has to be trained first: call `train` before `predict` or `sample_functions`")]
    NotTrained,
    /// When the marginal likelihood cannot be computed
    #[error("Likelihood computation error: {0}")]
    LikelihoodComputationError(String),
    /// When linear algebra computation fails (e.g. covariance matrix not positive definite)
    #[error(transparent)]
    LinalgError(#[from] linfa_linalg::LinalgError),
    /// When a kernel is built with inconsistent parameters
    #[error("Kernel error: {0}")]
    KernelError(String),
    /// When a linfa error occurs
    #[error(transparent)]
    LinfaError(#[from] linfa::error::Error),
    /// When error due to a bad value
    #[error("InvalidValue error: {0}")]
    InvalidValueError(String),
}
