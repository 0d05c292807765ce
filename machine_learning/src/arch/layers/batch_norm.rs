use ndarray::{Array1, Array2, ArrayD, ArrayView1, ArrayViewMut1, Axis};

use super::{ParamSpec, check_batch, single};
use crate::{MlErr, Result, initialization::Init};

/// Batch normalization over the last axis.
///
/// Its slice holds `gamma`, `beta`, `moving_mean` and `moving_variance`, in that order. The
/// moving statistics are updated during training forward passes and never receive gradients.
#[derive(Debug, Clone)]
pub struct BatchNorm {
    in_shape: Vec<usize>,
    momentum: f32,
    epsilon: f32,

    // Forward metadata
    cache: Option<Cache>,
}

#[derive(Debug, Clone)]
struct Cache {
    x_hat: Array2<f32>,
    inv_std: Array1<f32>,
    training: bool,
}

impl BatchNorm {
    pub fn new(in_shape: &[usize], momentum: f32, epsilon: f32) -> Result<Self> {
        if in_shape.is_empty() {
            return Err(MlErr::InvalidLayer(
                "batch normalization needs at least one feature axis".into(),
            ));
        }
        if !(0. ..=1.).contains(&momentum) || epsilon <= 0. {
            return Err(MlErr::InvalidLayer(format!(
                "batch normalization momentum must be in [0, 1] and epsilon positive, got {momentum} and {epsilon}"
            )));
        }

        Ok(Self {
            in_shape: in_shape.to_vec(),
            momentum,
            epsilon,
            cache: None,
        })
    }

    pub fn momentum(&self) -> f32 {
        self.momentum
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    fn channels(&self) -> usize {
        self.in_shape[self.in_shape.len() - 1]
    }

    pub fn size(&self) -> usize {
        4 * self.channels()
    }

    pub fn output_shape(&self) -> Vec<usize> {
        self.in_shape.clone()
    }

    pub fn param_specs(&self) -> Vec<ParamSpec> {
        let c = vec![self.channels()];
        vec![
            ParamSpec::new("gamma", c.clone(), Init::Ones),
            ParamSpec::new("beta", c.clone(), Init::Zeros),
            ParamSpec::new("moving_mean", c.clone(), Init::Zeros),
            ParamSpec::new("moving_variance", c, Init::Ones),
        ]
    }

    pub fn forward(
        &mut self,
        params: &mut [f32],
        inputs: &[&ArrayD<f32>],
        training: bool,
    ) -> Result<ArrayD<f32>> {
        let x = single("batch normalization", inputs)?;
        check_batch("batch normalization input", x, &self.in_shape)?;

        let c = self.channels();
        let x2 = x.to_shape((x.len() / c, c))?;

        let (mean, var) = if training && x2.nrows() > 0 {
            let mean = x2.sum_axis(Axis(0)) / x2.nrows() as f32;
            let var = (&x2 - &mean).mapv(|v| v * v).sum_axis(Axis(0)) / x2.nrows() as f32;

            let momentum = self.momentum;
            let [_, _, mut moving_mean, mut moving_var] = self.view_params_mut(params)?;
            moving_mean.zip_mut_with(&mean, |m, &b| *m = *m * momentum + b * (1. - momentum));
            moving_var.zip_mut_with(&var, |m, &b| *m = *m * momentum + b * (1. - momentum));
            (mean, var)
        } else {
            let [_, _, moving_mean, moving_var] = self.view_params(params)?;
            (moving_mean.to_owned(), moving_var.to_owned())
        };

        let eps = self.epsilon;
        let inv_std = var.mapv(|v| 1. / (v + eps).sqrt());
        let x_hat = (&x2 - &mean) * &inv_std;

        let [gamma, beta, ..] = self.view_params(params)?;
        let y = &x_hat * &gamma + &beta;

        self.cache = Some(Cache {
            x_hat,
            inv_std,
            training,
        });
        Ok(y.as_standard_layout().into_owned().into_shape_with_order(x.raw_dim())?)
    }

    pub fn backward(
        &mut self,
        params: &[f32],
        grad: &mut [f32],
        d: ArrayD<f32>,
    ) -> Result<Vec<ArrayD<f32>>> {
        let Some(cache) = &self.cache else {
            return Err(MlErr::MissingForwardPass("batch normalization".into()));
        };

        let c = self.channels();
        let shape = d.raw_dim();
        let d2 = d.to_shape((d.len() / c, c))?;
        let m = d2.nrows() as f32;

        let (dgamma_raw, rest) = grad.split_at_mut(c);
        let mut dgamma = ArrayViewMut1::from_shape(c, dgamma_raw)?;
        let mut dbeta = ArrayViewMut1::from_shape(c, &mut rest[..c])?;
        dgamma += &(&d2 * &cache.x_hat).sum_axis(Axis(0));
        dbeta += &d2.sum_axis(Axis(0));

        let [gamma, ..] = self.view_params(params)?;
        let dx_hat = &d2 * &gamma;

        let dx = if cache.training {
            let sum = dx_hat.sum_axis(Axis(0));
            let dot = (&dx_hat * &cache.x_hat).sum_axis(Axis(0));
            ((&dx_hat * m - &sum) - &cache.x_hat * &dot) * &cache.inv_std / m
        } else {
            dx_hat * &cache.inv_std
        };

        let dx = dx.as_standard_layout().into_owned();
        Ok(vec![dx.into_shape_with_order(shape)?])
    }

    fn view_params<'a>(&self, params: &'a [f32]) -> Result<[ArrayView1<'a, f32>; 4]> {
        let c = self.channels();
        let mut chunks = params.chunks_exact(c).take(4);
        let mut next = || -> Result<ArrayView1<'a, f32>> {
            let chunk = chunks.next().ok_or(MlErr::SizeMismatch {
                a: "batch normalization",
                b: "params",
                got: params.len(),
                expected: 4 * c,
            })?;
            Ok(ArrayView1::from(chunk))
        };

        Ok([next()?, next()?, next()?, next()?])
    }

    fn view_params_mut<'a>(&self, params: &'a mut [f32]) -> Result<[ArrayViewMut1<'a, f32>; 4]> {
        let c = self.channels();
        let len = params.len();
        if len < 4 * c {
            return Err(MlErr::SizeMismatch {
                a: "batch normalization",
                b: "params",
                got: len,
                expected: 4 * c,
            });
        }

        let (gamma, rest) = params.split_at_mut(c);
        let (beta, rest) = rest.split_at_mut(c);
        let (mean, rest) = rest.split_at_mut(c);
        let var = &mut rest[..c];
        Ok([gamma.into(), beta.into(), mean.into(), var.into()])
    }
}
