use std::num::NonZeroUsize;

use ndarray::{ArrayD, Axis};
use rand::{Rng, seq::SliceRandom};

use crate::{MlErr, Result};

/// Samples for a multi input, multi output model, batched along the first axis of every tensor.
#[derive(Debug, Clone)]
pub struct Dataset {
    inputs: Vec<ArrayD<f32>>,
    targets: Vec<ArrayD<f32>>,
    order: Vec<usize>,
}

impl Dataset {
    /// Returns a new `Dataset`.
    ///
    /// # Arguments
    /// * `inputs` - One tensor per model input.
    /// * `targets` - One tensor per model output.
    ///
    /// # Errors
    /// `MlErr::EmptyDataset` if there are no samples, `MlErr::SizeMismatch` if the tensors
    /// disagree on the amount of samples.
    pub fn new(inputs: Vec<ArrayD<f32>>, targets: Vec<ArrayD<f32>>) -> Result<Self> {
        let len = inputs
            .first()
            .filter(|x| x.ndim() > 0)
            .map(|x| x.len_of(Axis(0)))
            .unwrap_or(0);

        if len == 0 || targets.is_empty() {
            return Err(MlErr::EmptyDataset);
        }

        for x in inputs.iter().chain(&targets) {
            let got = if x.ndim() == 0 { 0 } else { x.len_of(Axis(0)) };
            if got != len {
                return Err(MlErr::SizeMismatch {
                    a: "tensor samples",
                    b: "dataset samples",
                    got,
                    expected: len,
                });
            }
        }

        Ok(Self {
            inputs,
            targets,
            order: (0..len).collect(),
        })
    }

    /// The amount of samples.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn inputs(&self) -> &[ArrayD<f32>] {
        &self.inputs
    }

    pub fn targets(&self) -> &[ArrayD<f32>] {
        &self.targets
    }

    /// Shuffles the order in which `batches` yields samples.
    pub fn shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        self.order.shuffle(rng);
    }

    /// Splits the samples in batches of `batch_size`, the last one may be smaller.
    ///
    /// # Returns
    /// An iterator of `(inputs, targets)` pairs.
    pub fn batches(
        &self,
        batch_size: NonZeroUsize,
    ) -> impl Iterator<Item = (Vec<ArrayD<f32>>, Vec<ArrayD<f32>>)> + '_ {
        self.order.chunks(batch_size.get()).map(|idx| {
            let select = |xs: &[ArrayD<f32>]| -> Vec<ArrayD<f32>> {
                xs.iter().map(|x| x.select(Axis(0), idx)).collect()
            };
            (select(&self.inputs), select(&self.targets))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use ndarray::{ArrayD, IxDyn};
    use rand::{SeedableRng, rngs::StdRng};

    use super::Dataset;

    fn column(values: &[f32]) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(&[values.len(), 1]), values.to_vec()).unwrap()
    }

    #[test]
    fn batches_keep_inputs_and_targets_aligned() {
        let xs = column(&[0., 1., 2., 3., 4.]);
        let ys = column(&[0., 10., 20., 30., 40.]);
        let mut dataset = Dataset::new(vec![xs], vec![ys]).unwrap();
        dataset.shuffle(&mut StdRng::seed_from_u64(3));

        let mut seen = 0;
        for (x, y) in dataset.batches(NonZeroUsize::new(2).unwrap()) {
            assert!(x[0].len_of(ndarray::Axis(0)) <= 2);
            for (a, b) in x[0].iter().zip(y[0].iter()) {
                assert_eq!(a * 10., *b);
            }
            seen += x[0].len();
        }
        assert_eq!(seen, 5);
    }

    #[test]
    fn mismatched_sample_counts_are_rejected() {
        let xs = column(&[0., 1., 2.]);
        let ys = column(&[0., 1.]);
        assert!(Dataset::new(vec![xs], vec![ys]).is_err());
    }

    #[test]
    fn empty_dataset_is_rejected() {
        let xs = ArrayD::zeros(IxDyn(&[0, 2]));
        let ys = ArrayD::zeros(IxDyn(&[0, 1]));
        assert!(Dataset::new(vec![xs], vec![ys]).is_err());
    }
}
