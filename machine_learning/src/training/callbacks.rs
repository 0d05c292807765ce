use std::ops::ControlFlow;

use log::info;

/// Hooks into a training run.
pub trait Callback {
    /// Called after every epoch with the epoch's mean training loss.
    ///
    /// # Returns
    /// `ControlFlow::Break` to stop training after this epoch.
    fn on_epoch_end(&mut self, epoch: usize, loss: f32, params: &[f32]) -> ControlFlow<()>;

    /// Called once training finishes, with write access to the parameters.
    fn on_train_end(&mut self, _params: &mut [f32]) {}
}

/// Stops training once the loss stops improving.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f32,
    restore_best_weights: bool,

    best: f32,
    wait: usize,
    best_params: Option<Vec<f32>>,
    stopped_epoch: Option<usize>,
}

impl EarlyStopping {
    /// Returns a new `EarlyStopping`.
    ///
    /// # Arguments
    /// * `patience` - The amount of epochs without improvement tolerated before stopping.
    /// * `min_delta` - The least decrease in loss counted as an improvement.
    /// * `restore_best_weights` - Whether to roll back to the best epoch's parameters when
    ///   training gets stopped.
    pub fn new(patience: usize, min_delta: f32, restore_best_weights: bool) -> Self {
        Self {
            patience,
            min_delta: min_delta.abs(),
            restore_best_weights,
            best: f32::INFINITY,
            wait: 0,
            best_params: None,
            stopped_epoch: None,
        }
    }

    /// The epoch training was stopped at, if it was.
    pub fn stopped_epoch(&self) -> Option<usize> {
        self.stopped_epoch
    }

    /// The lowest loss seen so far.
    pub fn best_loss(&self) -> f32 {
        self.best
    }
}

impl Callback for EarlyStopping {
    fn on_epoch_end(&mut self, epoch: usize, loss: f32, params: &[f32]) -> ControlFlow<()> {
        if loss < self.best - self.min_delta {
            self.best = loss;
            self.wait = 0;
            if self.restore_best_weights {
                self.best_params = Some(params.to_vec());
            }
            return ControlFlow::Continue(());
        }

        self.wait += 1;
        if self.wait >= self.patience && epoch > 0 {
            self.stopped_epoch = Some(epoch);
            return ControlFlow::Break(());
        }

        ControlFlow::Continue(())
    }

    fn on_train_end(&mut self, params: &mut [f32]) {
        let Some(epoch) = self.stopped_epoch else {
            return;
        };

        info!("early stopping at epoch {}", epoch + 1);
        if let Some(best) = self.best_params.as_deref().filter(|b| b.len() == params.len()) {
            info!("restoring weights from the epoch with loss {}", self.best);
            params.copy_from_slice(best);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ops::ControlFlow;

    use super::{Callback, EarlyStopping};

    #[test]
    fn stops_after_patience_epochs_without_improvement() {
        let mut es = EarlyStopping::new(2, 0., true);
        let losses = [1.0, 0.5, 0.6, 0.7, 0.4];

        let mut stopped = None;
        for (epoch, &loss) in losses.iter().enumerate() {
            let params = [loss];
            if es.on_epoch_end(epoch, loss, &params).is_break() {
                stopped = Some(epoch);
                break;
            }
        }

        assert_eq!(stopped, Some(3));
        assert_eq!(es.stopped_epoch(), Some(3));

        let mut params = [0.7];
        es.on_train_end(&mut params);
        assert_eq!(params, [0.5]);
    }

    #[test]
    fn keeps_final_weights_when_never_stopped() {
        let mut es = EarlyStopping::new(5, 0., true);
        for (epoch, loss) in [0.9, 0.8, 0.85].into_iter().enumerate() {
            assert_eq!(es.on_epoch_end(epoch, loss, &[loss]), ControlFlow::Continue(()));
        }

        let mut params = [0.85];
        es.on_train_end(&mut params);
        assert_eq!(params, [0.85]);
    }
}
