use std::f32::consts::{PI, SQRT_2};

use ndarray::{ArrayD, Axis};

const SELU_ALPHA: f32 = 1.673_263_2;
const SELU_SCALE: f32 = 1.050_701;
const GELU_COEF: f32 = 0.044_715;

/// An activation function, applied elementwise except for `Softmax`, which normalizes
/// over the last axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActFn {
    #[default]
    Linear,
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
    Softplus,
    Softsign,
    Elu,
    Selu,
    Swish,
    Gelu,
    GeluApprox,
    Exponential,
}
use ActFn::*;

impl ActFn {
    /// Looks up an activation by the name used in model descriptions.
    ///
    /// # Arguments
    /// * `name` - The activation's name, e.g. `"relu"`.
    ///
    /// # Returns
    /// The matching activation or `None` if the name is unknown.
    pub fn from_name(name: &str) -> Option<Self> {
        let act_fn = match name {
            "linear" => Linear,
            "relu" => Relu,
            "sigmoid" => Sigmoid,
            "tanh" => Tanh,
            "softmax" => Softmax,
            "softplus" => Softplus,
            "softsign" => Softsign,
            "elu" => Elu,
            "selu" => Selu,
            "swish" | "silu" => Swish,
            "gelu" => Gelu,
            "gelu_approx" => GeluApprox,
            "exponential" => Exponential,
            _ => return None,
        };

        Some(act_fn)
    }

    /// The canonical name of this activation.
    pub fn name(&self) -> &'static str {
        match self {
            Linear => "linear",
            Relu => "relu",
            Sigmoid => "sigmoid",
            Tanh => "tanh",
            Softmax => "softmax",
            Softplus => "softplus",
            Softsign => "softsign",
            Elu => "elu",
            Selu => "selu",
            Swish => "swish",
            Gelu => "gelu",
            GeluApprox => "gelu_approx",
            Exponential => "exponential",
        }
    }

    /// Applies the activation to the pre-activation values `z`.
    pub fn forward(&self, z: &ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Linear => z.clone(),
            Softmax => softmax(z),
            _ => z.mapv(|x| self.f(x)),
        }
    }

    /// Propagates `d`, the gradient with respect to the activation's output, back to its input.
    ///
    /// # Arguments
    /// * `z` - The pre-activation values of the forward pass.
    /// * `a` - The activation's output in the forward pass.
    /// * `d` - The gradient with respect to `a`.
    ///
    /// # Returns
    /// The gradient with respect to `z`.
    pub fn backward(&self, z: &ArrayD<f32>, a: &ArrayD<f32>, mut d: ArrayD<f32>) -> ArrayD<f32> {
        match self {
            Linear => d,
            Softmax => {
                let last = Axis(a.ndim().saturating_sub(1));
                let dot = (&d * a).sum_axis(last).insert_axis(last);
                (&d - &dot) * a
            }
            _ => {
                d.zip_mut_with(z, |d, &z| *d *= self.df(z));
                d
            }
        }
    }

    fn f(&self, x: f32) -> f32 {
        match self {
            Linear | Softmax => x,
            Relu => x.max(0.),
            Sigmoid => sigmoid(x),
            Tanh => x.tanh(),
            Softplus => x.max(0.) + (-x.abs()).exp().ln_1p(),
            Softsign => x / (1. + x.abs()),
            Elu => {
                if x > 0. {
                    x
                } else {
                    x.exp_m1()
                }
            }
            Selu => {
                if x > 0. {
                    SELU_SCALE * x
                } else {
                    SELU_SCALE * SELU_ALPHA * x.exp_m1()
                }
            }
            Swish => x * sigmoid(x),
            Gelu => x * normal_cdf(x),
            GeluApprox => 0.5 * x * (1. + gelu_inner(x).tanh()),
            Exponential => x.exp(),
        }
    }

    fn df(&self, x: f32) -> f32 {
        match self {
            Linear | Softmax => 1.,
            Relu => {
                if x > 0. {
                    1.
                } else {
                    0.
                }
            }
            Sigmoid => {
                let s = sigmoid(x);
                s * (1. - s)
            }
            Tanh => 1. - x.tanh().powi(2),
            Softplus => sigmoid(x),
            Softsign => 1. / (1. + x.abs()).powi(2),
            Elu => {
                if x > 0. {
                    1.
                } else {
                    x.exp()
                }
            }
            Selu => {
                if x > 0. {
                    SELU_SCALE
                } else {
                    SELU_SCALE * SELU_ALPHA * x.exp()
                }
            }
            Swish => {
                let s = sigmoid(x);
                s + x * s * (1. - s)
            }
            Gelu => normal_cdf(x) + x * (-0.5 * x * x).exp() / (2. * PI).sqrt(),
            GeluApprox => {
                let c = (2. / PI).sqrt();
                let t = gelu_inner(x).tanh();
                0.5 * (1. + t) + 0.5 * x * (1. - t * t) * c * (1. + 3. * GELU_COEF * x * x)
            }
            Exponential => x.exp(),
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1. / (1. + (-x).exp())
}

fn normal_cdf(x: f32) -> f32 {
    0.5 * (1. + erf(x / SQRT_2))
}

/// Abramowitz and Stegun 7.1.26, absolute error below 1.5e-7.
fn erf(x: f32) -> f32 {
    const P: f32 = 0.327_591_1;
    const A: [f32; 5] = [0.254_829_6, -0.284_496_74, 1.421_413_7, -1.453_152_1, 1.061_405_4];

    let sign = x.signum();
    let x = x.abs();
    let t = 1. / (1. + P * x);
    let poly = A.iter().rev().fold(0., |acc, a| acc * t + a) * t;
    sign * (1. - poly * (-x * x).exp())
}

// tanh approximation of the gaussian error linear unit
fn gelu_inner(x: f32) -> f32 {
    (2. / PI).sqrt() * (x + GELU_COEF * x.powi(3))
}

fn softmax(z: &ArrayD<f32>) -> ArrayD<f32> {
    let mut out = z.clone();
    if out.ndim() == 0 {
        out.fill(1.);
        return out;
    }

    let last = Axis(out.ndim() - 1);
    for mut lane in out.lanes_mut(last) {
        let max = lane.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        lane.mapv_inplace(|v| (v - max).exp());
        let sum = lane.sum();
        lane.mapv_inplace(|v| v / sum);
    }

    out
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::{ArrayD, IxDyn, array};

    use super::ActFn;

    #[test]
    fn names_round_trip() {
        for name in [
            "linear",
            "relu",
            "sigmoid",
            "tanh",
            "softmax",
            "softplus",
            "softsign",
            "elu",
            "selu",
            "swish",
            "gelu",
            "gelu_approx",
            "exponential",
        ] {
            let act_fn = ActFn::from_name(name).unwrap();
            assert_eq!(act_fn.name(), name);
        }

        assert_eq!(ActFn::from_name("silu"), Some(ActFn::Swish));
        assert_eq!(ActFn::from_name("leaky"), None);
    }

    #[test]
    fn softmax_rows_sum_to_one() {
        let z = array![[1., 2., 3.], [-1., 0., 1000.]].into_dyn();
        let a = ActFn::Softmax.forward(&z);

        for row in a.rows() {
            assert_abs_diff_eq!(row.sum(), 1., epsilon = 1e-6);
        }
        assert_abs_diff_eq!(a[[1, 2]], 1., epsilon = 1e-6);
    }

    #[test]
    fn elementwise_derivatives_match_finite_differences() {
        let eps = 1e-3;
        let xs = [-2.1f32, -0.7, 0.3, 1.9];

        for act_fn in [
            ActFn::Sigmoid,
            ActFn::Tanh,
            ActFn::Softplus,
            ActFn::Softsign,
            ActFn::Elu,
            ActFn::Selu,
            ActFn::Swish,
            ActFn::Gelu,
            ActFn::GeluApprox,
            ActFn::Exponential,
            ActFn::Relu,
        ] {
            for &x in &xs {
                let numeric = (act_fn.f(x + eps) - act_fn.f(x - eps)) / (2. * eps);
                assert_abs_diff_eq!(act_fn.df(x), numeric, epsilon = 1e-2);
            }
        }
    }

    #[test]
    fn gelu_uses_the_exact_error_function() {
        let gelu = |x: f32| ActFn::Gelu.forward(&array![x].into_dyn())[0];

        assert_abs_diff_eq!(gelu(0.), 0., epsilon = 1e-7);
        assert_abs_diff_eq!(gelu(1.), 0.841_344_7, epsilon = 1e-5);
        assert_abs_diff_eq!(gelu(-1.), -0.158_655_3, epsilon = 1e-5);
        assert_abs_diff_eq!(gelu(2.5), 2.484_475_8, epsilon = 1e-5);

        let approx = ActFn::GeluApprox.forward(&array![1.].into_dyn())[0];
        assert_abs_diff_eq!(approx, 0.841_192, epsilon = 1e-5);
    }

    #[test]
    fn softmax_backward_matches_finite_differences() {
        let z = ArrayD::from_shape_vec(IxDyn(&[1, 3]), vec![0.2f32, -0.4, 1.1]).unwrap();
        let w = [0.5f32, -1.5, 2.0];
        let objective = |z: &ArrayD<f32>| -> f32 {
            let a = ActFn::Softmax.forward(z);
            a.iter().zip(&w).map(|(a, w)| a * w).sum()
        };

        let a = ActFn::Softmax.forward(&z);
        let d = ArrayD::from_shape_vec(IxDyn(&[1, 3]), w.to_vec()).unwrap();
        let analytic = ActFn::Softmax.backward(&z, &a, d);

        let eps = 1e-3;
        for i in 0..3 {
            let mut plus = z.clone();
            plus[[0, i]] += eps;
            let mut minus = z.clone();
            minus[[0, i]] -= eps;
            let numeric = (objective(&plus) - objective(&minus)) / (2. * eps);
            assert_abs_diff_eq!(analytic[[0, i]], numeric, epsilon = 1e-2);
        }
    }
}
