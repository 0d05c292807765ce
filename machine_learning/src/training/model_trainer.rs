use std::num::NonZeroUsize;

use log::{info, trace};
use ndarray::ArrayD;
use rand::Rng;

use super::Callback;
use crate::{
    MlErr, Result,
    arch::{Graph, loss::LossFn},
    dataset::Dataset,
    optimization::Optimizer,
};

/// The losses recorded during a training run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    /// The mean training loss of every epoch that ran.
    pub losses: Vec<f32>,
}

impl History {
    /// The amount of epochs that ran.
    pub fn epochs(&self) -> usize {
        self.losses.len()
    }

    /// The loss of the last epoch.
    pub fn final_loss(&self) -> Option<f32> {
        self.losses.last().copied()
    }
}

/// A model trainer. Contains the components needed for fitting a graph to a dataset.
pub struct ModelTrainer<O, L, R>
where
    O: Optimizer,
    L: LossFn,
    R: Rng,
{
    optimizer: O,
    loss_fn: L,
    epochs: usize,
    batch_size: NonZeroUsize,
    shuffle: bool,
    rng: R,
}

impl<O, L, R> ModelTrainer<O, L, R>
where
    O: Optimizer,
    L: LossFn,
    R: Rng,
{
    /// Returns a new `ModelTrainer`.
    ///
    /// # Arguments
    /// * `optimizer` - The optimizer that dictates how to update the parameters on each batch.
    /// * `loss_fn` - The loss function used to measure the difference between a model's output and the expected one.
    /// * `epochs` - The maximum amount of passes over the dataset.
    /// * `batch_size` - The amount of samples per optimization step.
    /// * `shuffle` - Whether to shuffle the samples before every epoch.
    /// * `rng` - A random number generator.
    pub fn new(
        optimizer: O,
        loss_fn: L,
        epochs: usize,
        batch_size: NonZeroUsize,
        shuffle: bool,
        rng: R,
    ) -> Self {
        Self {
            optimizer,
            loss_fn,
            epochs,
            batch_size,
            shuffle,
            rng,
        }
    }

    /// Fits `graph` to `dataset`.
    ///
    /// # Arguments
    /// * `graph` - The model that will be trained, its parameters get updated on every batch.
    /// * `dataset` - The samples, with one target tensor per model output.
    /// * `callbacks` - Hooks run after every epoch and once training ends.
    ///
    /// # Returns
    /// The loss history of the run.
    pub fn fit(
        &mut self,
        graph: &mut Graph,
        dataset: &mut Dataset,
        callbacks: &mut [&mut dyn Callback],
    ) -> Result<History> {
        let mut history = History::default();
        let samples = dataset.len();

        for epoch in 0..self.epochs {
            if self.shuffle {
                dataset.shuffle(&mut self.rng);
            }

            let mut total = 0.;
            for (i, (xs, ys)) in dataset.batches(self.batch_size).enumerate() {
                let loss = self.train_batch(graph, &xs, &ys)?;
                trace!("epoch {} batch {i}: loss {loss}", epoch + 1);
                total += loss * batch_len(&ys) as f32;
            }

            let loss = total / samples as f32;
            info!("epoch {}/{}: loss {loss}", epoch + 1, self.epochs);
            history.losses.push(loss);

            let mut stop = false;
            for callback in callbacks.iter_mut() {
                if callback.on_epoch_end(epoch, loss, graph.params()).is_break() {
                    stop = true;
                }
            }

            if stop {
                break;
            }
        }

        for callback in callbacks.iter_mut() {
            callback.on_train_end(graph.params_mut());
        }

        Ok(history)
    }

    /// Runs one optimization step.
    ///
    /// # Returns
    /// The batch loss, summed over every output.
    fn train_batch(
        &mut self,
        graph: &mut Graph,
        xs: &[ArrayD<f32>],
        ys: &[ArrayD<f32>],
    ) -> Result<f32> {
        graph.zero_grad();
        let y_preds = graph.forward(xs, true)?;

        if y_preds.len() != ys.len() {
            return Err(MlErr::SizeMismatch {
                a: "targets",
                b: "model outputs",
                got: ys.len(),
                expected: y_preds.len(),
            });
        }

        let mut loss = 0.;
        let mut deltas = Vec::with_capacity(ys.len());
        for (y_pred, y) in y_preds.iter().zip(ys) {
            if y_pred.shape() != y.shape() {
                return Err(MlErr::shape("targets", y.shape(), y_pred.shape()));
            }

            loss += self.loss_fn.loss(y_pred, y);
            deltas.push(self.loss_fn.loss_prime(y_pred, y));
        }

        graph.backward(deltas)?;
        graph.step(&mut self.optimizer)?;
        Ok(loss)
    }
}

fn batch_len(ys: &[ArrayD<f32>]) -> usize {
    ys.first().map(|y| y.shape()[0]).unwrap_or(0)
}
