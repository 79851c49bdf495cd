//! Priors over the log-scale kernel hyperparameters.
//!
//! A prior adds `ln p(theta)` to the log marginal likelihood maximized at training
//! time, which turns the hyperparameter fit into a maximum a posteriori estimate.

use crate::errors::{GpError, Result};
use ndarray::{Array1, ArrayView1};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// 0.5 * ln(2 * pi)
const HALF_LN_2PI: f64 = 0.918_938_533_204_672_8;

/// A log-density over log-scale hyperparameters with its gradient
pub trait Prior: fmt::Debug + Send + Sync {
    /// `ln p(theta)`
    fn ln_prob(&self, theta: &ArrayView1<f64>) -> f64;

    /// Gradient of `ln p(theta)` with respect to `theta`
    fn gradient(&self, theta: &ArrayView1<f64>) -> Array1<f64>;

    /// Dimension of `theta` the prior is defined for, `None` when it applies to any size
    fn dim(&self) -> Option<usize> {
        None
    }
}

/// Standard univariate priors applied to one log-scale hyperparameter `t`
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum HyperPrior {
    /// Uniform on `[lower, upper]`, improper (not normalized)
    Tophat {
        /// lower bound
        lower: f64,
        /// upper bound
        upper: f64,
    },
    /// Normal distribution of `t`
    Normal {
        /// mean
        mean: f64,
        /// standard deviation
        sigma: f64,
    },
    /// Gamma distribution of `exp(t)`, expressed as a density of `t`
    Gamma {
        /// shape parameter
        shape: f64,
        /// scale parameter
        scale: f64,
    },
    /// Horseshoe-like density of `exp(t)`, `ln(ln(1 + 3 (scale / exp(t))^2))`
    Horseshoe {
        /// scale parameter
        scale: f64,
    },
}

fn check_positive(name: &str, value: f64) -> Result<()> {
    if !(value.is_finite() && value > 0.) {
        return Err(GpError::InvalidValueError(format!(
            "Prior {name} should be positive and finite, got {value}"
        )));
    }
    Ok(())
}

impl HyperPrior {
    /// Tophat prior constructor
    pub fn tophat(lower: f64, upper: f64) -> Result<Self> {
        if !(lower < upper) {
            return Err(GpError::InvalidValueError(format!(
                "Tophat prior bounds should verify lower < upper, got [{lower}, {upper}]"
            )));
        }
        Ok(HyperPrior::Tophat { lower, upper })
    }

    /// Normal prior constructor
    pub fn normal(mean: f64, sigma: f64) -> Result<Self> {
        check_positive("sigma", sigma)?;
        Ok(HyperPrior::Normal { mean, sigma })
    }

    /// Gamma prior constructor
    pub fn gamma(shape: f64, scale: f64) -> Result<Self> {
        check_positive("shape", shape)?;
        check_positive("scale", scale)?;
        Ok(HyperPrior::Gamma { shape, scale })
    }

    /// Horseshoe prior constructor
    pub fn horseshoe(scale: f64) -> Result<Self> {
        check_positive("scale", scale)?;
        Ok(HyperPrior::Horseshoe { scale })
    }

    /// Log density at `t`
    pub fn ln_pdf(&self, t: f64) -> f64 {
        match *self {
            HyperPrior::Tophat { lower, upper } => {
                if lower <= t && t <= upper {
                    0.
                } else {
                    f64::NEG_INFINITY
                }
            }
            HyperPrior::Normal { mean, sigma } => {
                let z = (t - mean) / sigma;
                -0.5 * z * z - sigma.ln() - HALF_LN_2PI
            }
            HyperPrior::Gamma { shape, scale } => {
                // Jacobian of exp(t) included
                shape * t - t.exp() / scale - libm::lgamma(shape) - shape * scale.ln()
            }
            HyperPrior::Horseshoe { scale } => {
                let a = 3. * (scale * (-t).exp()).powi(2);
                a.ln_1p().ln()
            }
        }
    }

    /// Derivative of the log density at `t`
    pub fn dln_pdf(&self, t: f64) -> f64 {
        match *self {
            HyperPrior::Tophat { .. } => 0.,
            HyperPrior::Normal { mean, sigma } => -(t - mean) / (sigma * sigma),
            HyperPrior::Gamma { shape, scale } => shape - t.exp() / scale,
            HyperPrior::Horseshoe { scale } => {
                let a = 3. * (scale * (-t).exp()).powi(2);
                -2. * a / ((1. + a) * a.ln_1p())
            }
        }
    }
}

/// The same prior applied independently to every component of `theta`
impl Prior for HyperPrior {
    fn ln_prob(&self, theta: &ArrayView1<f64>) -> f64 {
        theta.iter().map(|t| self.ln_pdf(*t)).sum()
    }

    fn gradient(&self, theta: &ArrayView1<f64>) -> Array1<f64> {
        theta.mapv(|t| self.dln_pdf(t))
    }
}

/// One prior per component of `theta`
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct IndependentPrior {
    priors: Vec<HyperPrior>,
}

impl IndependentPrior {
    /// Constructor, `priors[i]` applies to `theta[i]`
    pub fn new(priors: Vec<HyperPrior>) -> Self {
        IndependentPrior { priors }
    }

    /// Component priors
    pub fn priors(&self) -> &[HyperPrior] {
        &self.priors
    }
}

impl Prior for IndependentPrior {
    fn ln_prob(&self, theta: &ArrayView1<f64>) -> f64 {
        if theta.len() != self.priors.len() {
            return f64::NAN;
        }
        self.priors
            .iter()
            .zip(theta.iter())
            .map(|(p, t)| p.ln_pdf(*t))
            .sum()
    }

    fn gradient(&self, theta: &ArrayView1<f64>) -> Array1<f64> {
        if theta.len() != self.priors.len() {
            return Array1::from_elem(theta.len(), f64::NAN);
        }
        self.priors
            .iter()
            .zip(theta.iter())
            .map(|(p, t)| p.dln_pdf(*t))
            .collect()
    }

    fn dim(&self) -> Option<usize> {
        Some(self.priors.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use finitediff::FiniteDiff;
    use ndarray::array;

    #[test]
    fn test_normal_prior() {
        let prior = HyperPrior::normal(1., 2.).unwrap();
        let theta = array![1., 3.];
        let expected = -2. * (2f64.ln() + HALF_LN_2PI) - 0.5;
        assert_abs_diff_eq!(prior.ln_prob(&theta.view()), expected, epsilon = 1e-12);
        assert_abs_diff_eq!(prior.gradient(&theta.view()), array![0., -0.5]);
    }

    #[test]
    fn test_tophat_prior() {
        let prior = HyperPrior::tophat(-2., 2.).unwrap();
        assert_eq!(prior.ln_prob(&array![0., 1.5].view()), 0.);
        assert_eq!(prior.ln_prob(&array![0., 2.5].view()), f64::NEG_INFINITY);
        assert_abs_diff_eq!(prior.gradient(&array![0., 2.5].view()), array![0., 0.]);
        assert!(HyperPrior::tophat(1., 1.).is_err());
    }

    #[test]
    fn test_gamma_prior_integrates_to_one() {
        // density of t = ln(x) when x ~ Gamma(shape, scale)
        let prior = HyperPrior::gamma(2., 0.5).unwrap();
        let (lo, hi, n) = (-15., 5., 20000);
        let h = (hi - lo) / n as f64;
        let integral: f64 = (0..n)
            .map(|i| prior.ln_pdf(lo + (i as f64 + 0.5) * h).exp() * h)
            .sum();
        assert_abs_diff_eq!(integral, 1., epsilon = 1e-4);
    }

    #[test]
    fn test_independent_prior() {
        let prior = IndependentPrior::new(vec![
            HyperPrior::normal(0., 1.).unwrap(),
            HyperPrior::tophat(-1., 1.).unwrap(),
        ]);
        assert_eq!(prior.dim(), Some(2));
        let theta = array![1., 0.];
        assert_abs_diff_eq!(
            prior.ln_prob(&theta.view()),
            -0.5 - HALF_LN_2PI,
            epsilon = 1e-12
        );
        assert_abs_diff_eq!(prior.gradient(&theta.view()), array![-1., 0.]);
        assert!(prior.ln_prob(&array![1.].view()).is_nan());
    }

    #[test]
    fn test_prior_gradients() {
        let priors = [
            HyperPrior::normal(0.3, 1.5).unwrap(),
            HyperPrior::gamma(1.5, 2.).unwrap(),
            HyperPrior::horseshoe(0.1).unwrap(),
        ];
        let theta = array![-0.7, 0.2, 1.1];
        for prior in priors.iter() {
            let f = |t: &Vec<f64>| prior.ln_prob(&ArrayView1::from(t.as_slice()));
            let fdiff = theta.to_vec().central_diff(&f);
            assert_abs_diff_eq!(
                prior.gradient(&theta.view()),
                Array1::from(fdiff),
                epsilon = 1e-6
            );
        }
    }
}
