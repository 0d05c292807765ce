use ndarray::ArrayD;

use super::{check_batch, single};
use crate::{MlErr, Result, arch::activations::ActFn};

/// A standalone activation layer.
#[derive(Debug, Clone)]
pub struct Activation {
    shape: Vec<usize>,
    act_fn: ActFn,

    z: Option<ArrayD<f32>>,
    a: Option<ArrayD<f32>>,
}

impl Activation {
    pub fn new(shape: &[usize], act_fn: ActFn) -> Self {
        Self {
            shape: shape.to_vec(),
            act_fn,
            z: None,
            a: None,
        }
    }

    pub fn act_fn(&self) -> ActFn {
        self.act_fn
    }

    pub fn output_shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    pub fn forward(&mut self, inputs: &[&ArrayD<f32>]) -> Result<ArrayD<f32>> {
        let x = single("activation", inputs)?;
        check_batch("activation input", x, &self.shape)?;

        let a = self.act_fn.forward(x);
        self.z = Some(x.clone());
        self.a = Some(a.clone());
        Ok(a)
    }

    pub fn backward(&mut self, d: ArrayD<f32>) -> Result<Vec<ArrayD<f32>>> {
        let (Some(z), Some(a)) = (&self.z, &self.a) else {
            return Err(MlErr::MissingForwardPass("activation".into()));
        };

        Ok(vec![self.act_fn.backward(z, a, d)])
    }
}
