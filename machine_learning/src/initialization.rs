use rand::Rng;
use rand_distr::{Distribution, Uniform};

use crate::{MlErr, Result};

/// How a parameter tensor is filled before training.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Init {
    Zeros,
    Ones,
    /// Uniform in `[-limit, limit]` with `limit = sqrt(6 / (fan_in + fan_out))`.
    GlorotUniform { fan_in: usize, fan_out: usize },
}

impl Init {
    /// Fills `params` according to this initializer.
    ///
    /// # Arguments
    /// * `params` - The parameter slice to overwrite.
    /// * `rng` - The random source used by random initializers.
    ///
    /// # Errors
    /// `MlErr::InvalidInit` if the fans of a glorot initializer are both zero.
    pub fn fill<R: Rng + ?Sized>(&self, params: &mut [f32], rng: &mut R) -> Result<()> {
        match *self {
            Init::Zeros => params.fill(0.),
            Init::Ones => params.fill(1.),
            Init::GlorotUniform { fan_in, fan_out } => {
                let fans = fan_in + fan_out;
                if fans == 0 {
                    return Err(MlErr::InvalidInit("glorot fans sum to zero".into()));
                }

                let limit = (6. / fans as f32).sqrt();
                let dist = Uniform::new_inclusive(-limit, limit)
                    .map_err(|e| MlErr::InvalidInit(e.to_string()))?;

                params.iter_mut().for_each(|p| *p = dist.sample(rng));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::{SeedableRng, rngs::StdRng};

    use super::Init;

    #[test]
    fn glorot_stays_within_limit() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut params = vec![0.; 256];
        Init::GlorotUniform {
            fan_in: 4,
            fan_out: 2,
        }
        .fill(&mut params, &mut rng)
        .unwrap();

        let limit = 1.0f32;
        assert!(params.iter().all(|p| p.abs() <= limit));
        assert!(params.iter().any(|&p| p != 0.));
    }

    #[test]
    fn glorot_with_no_fans_fails() {
        let mut rng = StdRng::seed_from_u64(0);
        let init = Init::GlorotUniform {
            fan_in: 0,
            fan_out: 0,
        };
        assert!(init.fill(&mut [0.; 3], &mut rng).is_err());
    }
}
