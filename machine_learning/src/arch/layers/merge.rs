use ndarray::ArrayD;

use super::check_batch;
use crate::{MlErr, Result};

/// How a `Merge` layer combines its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOp {
    Add,
    Multiply,
}

/// Elementwise combination of two or more equally shaped tensors.
#[derive(Debug, Clone)]
pub struct Merge {
    op: MergeOp,
    shape: Vec<usize>,
    arity: usize,

    // Inputs of the last forward pass, only kept for products
    xs: Option<Vec<ArrayD<f32>>>,
}

impl Merge {
    /// Returns a new `Merge`.
    ///
    /// # Arguments
    /// * `op` - The combining operation.
    /// * `shapes` - The feature shape of every input.
    ///
    /// # Errors
    /// `MlErr::InvalidLayer` with less than two inputs, `MlErr::ShapeMismatch` if they differ.
    pub fn new(op: MergeOp, shapes: &[&[usize]]) -> Result<Self> {
        let [first, rest @ ..] = shapes else {
            return Err(MlErr::InvalidLayer("merge layers need inputs".into()));
        };

        if rest.is_empty() {
            return Err(MlErr::InvalidLayer(format!(
                "{op:?} needs at least two inputs, got one"
            )));
        }

        if let Some(other) = rest.iter().find(|s| s != &first) {
            return Err(MlErr::shape(format!("{op:?} input"), other, first));
        }

        Ok(Self {
            op,
            shape: first.to_vec(),
            arity: shapes.len(),
            xs: None,
        })
    }

    pub fn op(&self) -> MergeOp {
        self.op
    }

    pub fn output_shape(&self) -> Vec<usize> {
        self.shape.clone()
    }

    pub fn forward(&mut self, inputs: &[&ArrayD<f32>]) -> Result<ArrayD<f32>> {
        if inputs.len() != self.arity {
            return Err(MlErr::SizeMismatch {
                a: "merge inputs",
                b: "declared inputs",
                got: inputs.len(),
                expected: self.arity,
            });
        }

        for x in inputs {
            check_batch("merge input", x, &self.shape)?;
        }

        let mut out = inputs[0].clone();
        for x in &inputs[1..] {
            match self.op {
                MergeOp::Add => out += *x,
                MergeOp::Multiply => out *= *x,
            }
        }

        if self.op == MergeOp::Multiply {
            self.xs = Some(inputs.iter().map(|&x| x.clone()).collect());
        }

        Ok(out)
    }

    pub fn backward(&mut self, d: ArrayD<f32>) -> Result<Vec<ArrayD<f32>>> {
        match self.op {
            MergeOp::Add => Ok(vec![d; self.arity]),
            MergeOp::Multiply => {
                let Some(xs) = &self.xs else {
                    return Err(MlErr::MissingForwardPass("multiply".into()));
                };

                let grads = (0..xs.len())
                    .map(|i| {
                        xs.iter()
                            .enumerate()
                            .filter(|&(j, _)| j != i)
                            .fold(d.clone(), |acc, (_, x)| acc * x)
                    })
                    .collect();

                Ok(grads)
            }
        }
    }
}
