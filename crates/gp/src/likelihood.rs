//! Objective minimized when fitting the kernel hyperparameters.

use crate::errors::Result;
use crate::priors::Prior;
use log::debug;
use ndarray::{Array1, ArrayView1};

/// Value (and gradient components) returned by [`NegLogLikelihood`] when the likelihood
/// cannot be evaluated or is not finite
pub const NLL_PENALTY: f64 = 1e25;

/// Log marginal likelihood of a fitted model as a function of the kernel hyperparameters
pub trait MarginalLikelihood {
    /// Log marginal likelihood at log-scale hyperparameters `theta` and optionally its
    /// gradient. The fitted state is left untouched.
    fn log_marginal_likelihood(
        &self,
        theta: &ArrayView1<f64>,
        eval_gradient: bool,
    ) -> Result<(f64, Option<Array1<f64>>)>;
}

/// Negative log marginal likelihood, optionally penalized by a hyperparameter prior.
///
/// Evaluation never fails: whenever the likelihood, the prior or one of their gradient
/// components is not finite, `NLL_PENALTY` is returned for the value and for every
/// gradient component so that the optimizer is pushed away from that region.
pub struct NegLogLikelihood<'a, L: MarginalLikelihood + ?Sized> {
    model: &'a L,
    prior: Option<&'a dyn Prior>,
}

impl<'a, L: MarginalLikelihood + ?Sized> NegLogLikelihood<'a, L> {
    /// Objective of the given fitted model
    pub fn new(model: &'a L, prior: Option<&'a dyn Prior>) -> Self {
        NegLogLikelihood { model, prior }
    }

    /// Objective value and gradient at `theta`
    pub fn evaluate(&self, theta: &ArrayView1<f64>) -> (f64, Array1<f64>) {
        let (mut lml, mut grad) = match self.model.log_marginal_likelihood(theta, true) {
            Ok((lml, Some(grad))) => (lml, grad),
            Ok((_, None)) => return penalty(theta.len()),
            Err(err) => {
                debug!("Likelihood evaluation error at theta = {theta}: {err}");
                return penalty(theta.len());
            }
        };

        if grad.len() != theta.len() {
            debug!("Likelihood gradient size mismatch at theta = {theta}, penalty used");
            return penalty(theta.len());
        }
        if let Some(prior) = self.prior {
            let prior_grad = prior.gradient(theta);
            if prior_grad.len() != theta.len() {
                debug!("Prior gradient size mismatch at theta = {theta}, penalty used");
                return penalty(theta.len());
            }
            lml += prior.ln_prob(theta);
            grad = grad + prior_grad;
        }

        if !lml.is_finite() || grad.iter().any(|g| !g.is_finite()) {
            debug!("Non finite likelihood at theta = {theta}, penalty used");
            return penalty(theta.len());
        }
        (-lml, -grad)
    }

    /// Objective value at `theta`
    pub fn value(&self, theta: &ArrayView1<f64>) -> f64 {
        self.evaluate(theta).0
    }
}

fn penalty(n: usize) -> (f64, Array1<f64>) {
    (NLL_PENALTY, Array1::from_elem(n, NLL_PENALTY))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::GpError;
    use crate::priors::HyperPrior;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    /// lml(theta) = -sum(theta^2), or a given constant when `fixed` is set
    struct Quadratic {
        fixed: Option<f64>,
    }

    impl MarginalLikelihood for Quadratic {
        fn log_marginal_likelihood(
            &self,
            theta: &ArrayView1<f64>,
            _eval_gradient: bool,
        ) -> Result<(f64, Option<Array1<f64>>)> {
            match self.fixed {
                Some(v) => Ok((v, Some(Array1::zeros(theta.len())))),
                None => Ok((-theta.mapv(|t| t * t).sum(), Some(theta.mapv(|t| -2. * t)))),
            }
        }
    }

    struct Failing;

    impl MarginalLikelihood for Failing {
        fn log_marginal_likelihood(
            &self,
            _theta: &ArrayView1<f64>,
            _eval_gradient: bool,
        ) -> Result<(f64, Option<Array1<f64>>)> {
            Err(GpError::LikelihoodComputationError("boom".to_string()))
        }
    }

    #[test]
    fn test_nll_without_prior() {
        let model = Quadratic { fixed: None };
        let nll = NegLogLikelihood::new(&model, None);
        let (v, g) = nll.evaluate(&array![1., -2.].view());
        assert_abs_diff_eq!(v, 5.);
        assert_abs_diff_eq!(g, array![2., -4.]);
    }

    #[test]
    fn test_nll_with_prior() {
        let model = Quadratic { fixed: None };
        let prior = HyperPrior::normal(0., 1.).unwrap();
        let nll = NegLogLikelihood::new(&model, Some(&prior));
        let theta = array![1., -2.];
        // lml = -5, ln_prob = -0.5 * 5 - ln(2 pi), grad lml = [-2, 4], grad ln_prob = [-1, 2]
        let (v, g) = nll.evaluate(&theta.view());
        let expected = 5. + 2.5 + (2. * std::f64::consts::PI).ln();
        assert_abs_diff_eq!(v, expected, epsilon = 1e-12);
        assert_abs_diff_eq!(g, array![3., -6.], epsilon = 1e-12);
        assert_abs_diff_eq!(nll.value(&theta.view()), expected, epsilon = 1e-12);
    }

    #[test]
    fn test_nll_penalty() {
        for lml in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let model = Quadratic { fixed: Some(lml) };
            let nll = NegLogLikelihood::new(&model, None);
            let (v, g) = nll.evaluate(&array![0.1, 0.2, 0.3].view());
            assert_eq!(v, NLL_PENALTY);
            assert_eq!(g, Array1::from_elem(3, NLL_PENALTY));
        }
    }

    #[test]
    fn test_nll_penalty_from_prior() {
        let model = Quadratic { fixed: None };
        let prior = HyperPrior::tophat(-1., 1.).unwrap();
        let nll = NegLogLikelihood::new(&model, Some(&prior));
        let (v, g) = nll.evaluate(&array![0.5, 3.].view());
        assert_eq!(v, NLL_PENALTY);
        assert_eq!(g, array![NLL_PENALTY, NLL_PENALTY]);
    }

    #[test]
    fn test_nll_penalty_on_error() {
        let nll = NegLogLikelihood::new(&Failing, None);
        let (v, g) = nll.evaluate(&array![0.].view());
        assert_eq!(v, NLL_PENALTY);
        assert_eq!(g, array![NLL_PENALTY]);
    }

    /// Prior returning a gradient of fixed size whatever theta
    #[derive(Debug)]
    struct FixedSizePrior(usize);

    impl Prior for FixedSizePrior {
        fn ln_prob(&self, _theta: &ArrayView1<f64>) -> f64 {
            0.
        }

        fn gradient(&self, _theta: &ArrayView1<f64>) -> Array1<f64> {
            Array1::zeros(self.0)
        }
    }

    #[test]
    fn test_nll_penalty_on_prior_size_mismatch() {
        let model = Quadratic { fixed: None };
        for n in [1, 3] {
            let prior = FixedSizePrior(n);
            let nll = NegLogLikelihood::new(&model, Some(&prior));
            let (v, g) = nll.evaluate(&array![0.5, -0.5].view());
            assert_eq!(v, NLL_PENALTY);
            assert_eq!(g, array![NLL_PENALTY, NLL_PENALTY]);
        }
    }
}
