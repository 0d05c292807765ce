use ndarray::ArrayD;

/// A loss function over a batch of predictions.
pub trait LossFn {
    /// Computes the loss of `y_pred` against the expected `y`.
    fn loss(&self, y_pred: &ArrayD<f32>, y: &ArrayD<f32>) -> f32;

    /// Computes the gradient of the loss with respect to `y_pred`.
    fn loss_prime(&self, y_pred: &ArrayD<f32>, y: &ArrayD<f32>) -> ArrayD<f32>;
}
