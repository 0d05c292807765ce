use ndarray::{ArrayD, ArrayView1, Axis, Zip};

use super::LossFn;

const EPSILON: f32 = 1e-7;

/// Categorical cross-entropy over probability distributions laid along the last axis.
///
/// Each distribution is first rescaled to sum to one, then clipped to `[1e-7, 1 - 1e-7]`.
/// The loss is averaged over samples.
#[derive(Debug, Default, Clone, Copy)]
pub struct CategoricalCrossentropy;

impl CategoricalCrossentropy {
    pub fn new() -> Self {
        Self
    }

    fn samples(y_pred: &ArrayD<f32>) -> f32 {
        let classes = y_pred.shape().last().copied().unwrap_or(1).max(1);
        (y_pred.len() / classes).max(1) as f32
    }

    fn class_axis(y_pred: &ArrayD<f32>) -> Axis {
        Axis(y_pred.ndim().saturating_sub(1))
    }

    fn total(p: ArrayView1<f32>) -> f32 {
        p.sum().max(f32::MIN_POSITIVE)
    }
}

impl LossFn for CategoricalCrossentropy {
    fn loss(&self, y_pred: &ArrayD<f32>, y: &ArrayD<f32>) -> f32 {
        if y_pred.ndim() == 0 {
            return 0.;
        }

        let axis = Self::class_axis(y_pred);
        let mut total = 0.;
        Zip::from(y_pred.lanes(axis))
            .and(y.lanes(axis))
            .for_each(|p, t| {
                let s = Self::total(p);
                total -= p
                    .iter()
                    .zip(t)
                    .map(|(&p, &t)| t * (p / s).clamp(EPSILON, 1. - EPSILON).ln())
                    .sum::<f32>();
            });

        total / Self::samples(y_pred)
    }

    /// Differentiates through the rescaling: for an unclipped class `i` of a distribution
    /// summing to `s`, `dL/dp_i = (sum of unclipped y_j - y_i / q_i) / s` with `q = p / s`.
    fn loss_prime(&self, y_pred: &ArrayD<f32>, y: &ArrayD<f32>) -> ArrayD<f32> {
        let mut d = ArrayD::zeros(y_pred.raw_dim());
        if y_pred.ndim() == 0 {
            return d;
        }

        let n = Self::samples(y_pred);
        let axis = Self::class_axis(y_pred);
        Zip::from(d.lanes_mut(axis))
            .and(y_pred.lanes(axis))
            .and(y.lanes(axis))
            .for_each(|mut d, p, t| {
                let s = Self::total(p);
                let unclipped = |q: f32| (EPSILON..=1. - EPSILON).contains(&q);
                let y_sum: f32 = p
                    .iter()
                    .zip(t)
                    .filter(|&(&p, _)| unclipped(p / s))
                    .map(|(_, &t)| t)
                    .sum();

                for ((d, &p), &t) in d.iter_mut().zip(p).zip(t) {
                    let q = p / s;
                    let own = if unclipped(q) { t / q } else { 0. };
                    *d = (y_sum - own) / (s * n);
                }
            });

        d
    }
}
