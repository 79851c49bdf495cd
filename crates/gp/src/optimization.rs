use log::{debug, warn};
use ndarray::{arr1, Array1};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// How the log-space kernel bounds are handed to the optimizer.
///
/// The objective always works on log-scale hyperparameters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum BoundsConvention {
    /// Optimizer bounds are `(exp(lo), exp(hi))` while the search variable stays on the
    /// log scale, as done historically by the surrogate
    #[default]
    Exponentiated,
    /// Optimizer bounds are the log-space kernel bounds
    Log,
}

impl BoundsConvention {
    /// Bounds actually given to the optimizer from log-space kernel bounds
    pub fn optimizer_bounds(&self, log_bounds: &[(f64, f64)]) -> Vec<(f64, f64)> {
        match self {
            BoundsConvention::Exponentiated => log_bounds
                .iter()
                .map(|(lo, up)| (lo.exp(), up.exp()))
                .collect(),
            BoundsConvention::Log => log_bounds.to_vec(),
        }
    }
}

/// Bounded optimizer used to fit kernel hyperparameters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub enum ThetaOptimizer {
    /// Gradient-based SQP with quasi-Newton (BFGS) updates
    #[default]
    Slsqp,
    /// Derivative-free linear approximations
    Cobyla,
}

pub(crate) struct OptimParams {
    pub max_eval: usize,
    pub ftol_rel: f64,
    pub ftol_abs: f64,
    /// initial trust region radius used by cobyla
    pub rhobeg: f64,
}

impl Default for OptimParams {
    fn default() -> Self {
        OptimParams {
            max_eval: 200,
            ftol_rel: 1e-8,
            ftol_abs: 0.,
            rhobeg: 0.5,
        }
    }
}

/// Projects `x` into `bounds`
fn project(x: &Array1<f64>, bounds: &[(f64, f64)]) -> Vec<f64> {
    x.iter()
        .zip(bounds)
        .map(|(v, (lo, up))| v.max(*lo).min(*up))
        .collect()
}

/// Minimizes `objfn` from `theta0` within `bounds`.
///
/// Returns the objective value and the parameters at termination. Optimizer failures are
/// logged and the last iterate is returned (the projected start when it is unusable).
pub(crate) fn optimize_theta<ObjF>(
    objfn: ObjF,
    theta0: &Array1<f64>,
    bounds: &[(f64, f64)],
    optimizer: ThetaOptimizer,
    params: &OptimParams,
) -> (f64, Array1<f64>)
where
    ObjF: Fn(&[f64], Option<&mut [f64]>, &mut ()) -> f64,
{
    let x0 = project(theta0, bounds);
    debug!("Optimize theta from {x0:?} within {bounds:?} using {optimizer:?}");

    let (status, x_opt, fval) = match optimizer {
        ThetaOptimizer::Slsqp => {
            let cons: Vec<fn(&[f64], Option<&mut [f64]>, &mut ()) -> f64> = vec![];
            match slsqp::minimize(
                |x: &[f64], g: Option<&mut [f64]>, u: &mut ()| objfn(x, g, u),
                &x0,
                bounds,
                &cons,
                (),
                params.max_eval,
                Some(slsqp::StopTols {
                    ftol_rel: params.ftol_rel,
                    ftol_abs: params.ftol_abs,
                    ..slsqp::StopTols::default()
                }),
            ) {
                Ok((status, x_opt, fval)) => (Ok(format!("{status:?}")), x_opt, fval),
                Err((status, x_opt, fval)) => (Err(format!("{status:?}")), x_opt, fval),
            }
        }
        ThetaOptimizer::Cobyla => {
            use cobyla::{minimize, Func, StopTols};

            let cons: Vec<&dyn Func<()>> = vec![];
            match minimize(
                |x: &[f64], u: &mut ()| objfn(x, None, u),
                &x0,
                bounds,
                &cons,
                (),
                params.max_eval,
                cobyla::RhoBeg::All(params.rhobeg),
                Some(StopTols {
                    ftol_rel: params.ftol_rel,
                    ftol_abs: params.ftol_abs,
                    ..StopTols::default()
                }),
            ) {
                Ok((status, x_opt, fval)) => (Ok(format!("{status:?}")), x_opt, fval),
                Err((status, x_opt, fval)) => (Err(format!("{status:?}")), x_opt, fval),
            }
        }
    };

    if let Err(status) = &status {
        warn!("{optimizer:?} optimizer did not converge (status={status}), last iterate kept");
    }
    if x_opt.len() != x0.len() || x_opt.iter().any(|v| !v.is_finite()) {
        warn!("{optimizer:?} optimizer returned unusable parameters {x_opt:?}, start kept");
        let fval = objfn(&x0, None, &mut ());
        return (fval, arr1(&x0));
    }
    let fval = if f64::is_nan(fval) {
        f64::INFINITY
    } else {
        fval
    };
    debug!("Optimization end: {status:?}, f = {fval}, theta = {x_opt:?}");
    (fval, arr1(&x_opt))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn quadratic(x: &[f64], g: Option<&mut [f64]>, _u: &mut ()) -> f64 {
        if let Some(g) = g {
            g[0] = 2. * (x[0] - 1.);
            g[1] = 2. * (x[1] + 0.5);
        }
        (x[0] - 1.).powi(2) + (x[1] + 0.5).powi(2)
    }

    #[test]
    fn test_bounds_convention() {
        let log_bounds = [(-1., 2.)];
        assert_abs_diff_eq!(
            BoundsConvention::Exponentiated.optimizer_bounds(&log_bounds)[0].1,
            2f64.exp()
        );
        assert_eq!(BoundsConvention::Log.optimizer_bounds(&log_bounds), vec![(-1., 2.)]);
        assert_eq!(BoundsConvention::default(), BoundsConvention::Exponentiated);
    }

    #[test]
    fn test_slsqp_unconstrained_minimum() {
        let (f, x) = optimize_theta(
            quadratic,
            &array![0., 0.],
            &[(-5., 5.), (-5., 5.)],
            ThetaOptimizer::Slsqp,
            &OptimParams::default(),
        );
        assert_abs_diff_eq!(x, array![1., -0.5], epsilon = 1e-4);
        assert_abs_diff_eq!(f, 0., epsilon = 1e-6);
    }

    #[test]
    fn test_slsqp_active_bound() {
        let (_, x) = optimize_theta(
            quadratic,
            &array![3., 0.],
            &[(2., 5.), (-5., 5.)],
            ThetaOptimizer::Slsqp,
            &OptimParams::default(),
        );
        assert_abs_diff_eq!(x, array![2., -0.5], epsilon = 1e-4);
    }

    #[test]
    fn test_cobyla_minimum() {
        let (_, x) = optimize_theta(
            quadratic,
            &array![0., 0.],
            &[(-5., 5.), (-5., 5.)],
            ThetaOptimizer::Cobyla,
            &OptimParams {
                ftol_rel: 1e-10,
                ..OptimParams::default()
            },
        );
        assert_abs_diff_eq!(x, array![1., -0.5], epsilon = 1e-2);
    }

    #[test]
    fn test_start_projected_into_bounds() {
        let x0 = project(&array![-10., 0.3, 10.], &[(0., 1.), (0., 1.), (0., 1.)]);
        assert_eq!(x0, vec![0., 0.3, 1.]);
    }
}
