use ndarray::ArrayD;
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::{check_batch, single};
use crate::{MlErr, Result};

/// Inverted dropout, an identity outside of training.
#[derive(Debug, Clone)]
pub struct Dropout {
    shape: Vec<usize>,
    rate: f32,
    seed: Option<u64>,
    rng: StdRng,

    mask: Option<ArrayD<f32>>,
}

impl Dropout {
    /// Returns a new `Dropout`.
    ///
    /// # Arguments
    /// * `shape` - The feature shape of the input.
    /// * `rate` - The fraction of units dropped, in `[0, 1)`.
    /// * `seed` - An optional seed for the dropout mask.
    pub fn new(shape: &[usize], rate: f32, seed: Option<u64>) -> Result<Self> {
        if !(0. ..1.).contains(&rate) {
            return Err(MlErr::InvalidLayer(format!(
                "dropout rate must be in [0, 1), got {rate}"
            )));
        }

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(&mut rand::rng()),
        };

        Ok(Self {
            shape: shape.to_vec(),
            rate,
            seed,
            rng,
            mask: None,
        })
    }

    pub fn rate(&self) -> f32 {
        self.rate
    }

    /// The seed the mask generator started from, if one was given.
    pub fn seed(&self) -> Option<u64> {
        self.seed
    }

    pub fn output_shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    pub fn forward(&mut self, inputs: &[&ArrayD<f32>], training: bool) -> Result<ArrayD<f32>> {
        let x = single("dropout", inputs)?;
        check_batch("dropout input", x, &self.shape)?;

        if !training || self.rate == 0. {
            self.mask = None;
            return Ok(x.clone());
        }

        let keep = 1. - self.rate;
        let rng = &mut self.rng;
        let mask = x.mapv(|_| {
            if rng.random::<f32>() < keep {
                1. / keep
            } else {
                0.
            }
        });

        let y = x * &mask;
        self.mask = Some(mask);
        Ok(y)
    }

    pub fn backward(&mut self, d: ArrayD<f32>) -> Vec<ArrayD<f32>> {
        match &self.mask {
            Some(mask) => vec![d * mask],
            None => vec![d],
        }
    }
}
