use ndarray::{Array1, Array2, Array3, ArrayBase, Axis, Data, Ix1, Ix2};
#[cfg(feature = "serializable")]
use serde::{Deserialize, Serialize};

/// Affine transform of the training targets to zero mean and unit variance.
///
/// Parameters are computed once from the targets given at training time and kept
/// alongside the fitted model to map predictions back to the original output scale.
#[derive(Clone, Copy, Debug, PartialEq)]
#[cfg_attr(feature = "serializable", derive(Serialize, Deserialize))]
pub struct OutputNormalizer {
    /// mean of the training targets
    mean: f64,
    /// standard deviation of the training targets (1 when targets are constant)
    std: f64,
}

impl OutputNormalizer {
    /// Constructor computing mean and (population) standard deviation of `y`
    pub fn new(y: &ArrayBase<impl Data<Elem = f64>, Ix1>) -> OutputNormalizer {
        let n = y.len().max(1) as f64;
        let mean = y.sum() / n;
        let std = (y.mapv(|v| (v - mean) * (v - mean)).sum() / n).sqrt();
        let std = if std == 0. || !std.is_finite() {
            1.
        } else {
            std
        };
        OutputNormalizer { mean, std }
    }

    /// Mean of the training targets
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Standard deviation of the training targets
    pub fn std(&self) -> f64 {
        self.std
    }

    /// Zero mean, unit variance transform
    pub fn transform(&self, y: &ArrayBase<impl Data<Elem = f64>, Ix1>) -> Array1<f64> {
        y.mapv(|v| (v - self.mean) / self.std)
    }

    /// Back to the original output scale
    pub fn untransform(&self, y: &ArrayBase<impl Data<Elem = f64>, Ix1>) -> Array1<f64> {
        y.mapv(|v| v * self.std + self.mean)
    }

    /// Variances are only scaled
    pub fn untransform_var(&self, var: &ArrayBase<impl Data<Elem = f64>, Ix1>) -> Array1<f64> {
        let s2 = self.std * self.std;
        var.mapv(|v| v * s2)
    }

    /// Covariances are only scaled
    pub fn untransform_cov(&self, cov: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Array2<f64> {
        let s2 = self.std * self.std;
        cov.mapv(|v| v * s2)
    }

    /// Untransform each row of a (n_funcs, n_points) sample matrix
    pub fn untransform_samples(
        &self,
        samples: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    ) -> Array2<f64> {
        samples.mapv(|v| v * self.std + self.mean)
    }
}

/// Computes the (n1, n2, nx) array of squared differences between rows of `x1` and `x2`
/// scaled component-wise by `length_scale` (either of size 1 or of size nx)
pub(crate) fn scaled_sq_differences(
    x1: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    x2: &ArrayBase<impl Data<Elem = f64>, Ix2>,
    length_scale: &Array1<f64>,
) -> Array3<f64> {
    let x3 = x1.to_owned().insert_axis(Axis(1));
    let y3 = x2.to_owned().insert_axis(Axis(0));
    let d = (&x3 - &y3) / length_scale;
    d.mapv(|v| v * v)
}

/// Computes the (n, n) matrix of squared euclidean distances between rows of `x`
pub(crate) fn pairwise_sq_distances(x: &ArrayBase<impl Data<Elem = f64>, Ix2>) -> Array2<f64> {
    scaled_sq_differences(x, x, &Array1::ones(1)).sum_axis(Axis(2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_normalizer_roundtrip() {
        let y = array![0.3, -1.2, 4.5, 2.2, 0.0];
        let normalizer = OutputNormalizer::new(&y);
        let yt = normalizer.transform(&y);
        assert_abs_diff_eq!(yt.mean().unwrap(), 0., epsilon = 1e-12);
        assert_abs_diff_eq!(yt.mapv(|v| v * v).mean().unwrap(), 1., epsilon = 1e-12);
        assert_abs_diff_eq!(normalizer.untransform(&yt), y, epsilon = 1e-12);
    }

    #[test]
    fn test_normalizer_constant_targets() {
        let y = array![3., 3., 3.];
        let normalizer = OutputNormalizer::new(&y);
        assert_abs_diff_eq!(normalizer.std(), 1.);
        assert_abs_diff_eq!(normalizer.transform(&y), array![0., 0., 0.]);
        assert_abs_diff_eq!(normalizer.untransform_var(&array![0.5]), array![0.5]);
    }

    #[test]
    fn test_normalizer_scales_variance() {
        let y = array![0., 2.];
        let normalizer = OutputNormalizer::new(&y);
        assert_abs_diff_eq!(normalizer.mean(), 1.);
        assert_abs_diff_eq!(normalizer.std(), 1.);
        let y = array![0., 4.];
        let normalizer = OutputNormalizer::new(&y);
        assert_abs_diff_eq!(normalizer.untransform_var(&array![1., 0.5]), array![4., 2.]);
        assert_abs_diff_eq!(
            normalizer.untransform_cov(&array![[1., 0.5], [0.5, 1.]]),
            array![[4., 2.], [2., 4.]]
        );
    }

    #[test]
    fn test_scaled_sq_differences() {
        let x1 = array![[0., 1.], [2., 3.]];
        let x2 = array![[1., 1.]];
        let d = scaled_sq_differences(&x1, &x2, &array![1., 2.]);
        assert_eq!(d.shape(), &[2, 1, 2]);
        assert_abs_diff_eq!(d, array![[[1., 0.]], [[1., 1.]]]);
        let d2 = pairwise_sq_distances(&x1);
        assert_abs_diff_eq!(d2, array![[0., 8.], [8., 0.]]);
    }
}
